//! The `dispatch` module is the client-side half of shared subscriptions.
//!
//! The broker already balances a shared group's messages across consumer
//! processes; whatever reaches this process is routed here to the local
//! handlers registered for matching topic filters.

pub mod dispatcher;
pub mod filter;

pub use dispatcher::{
    Delivery, DispatchOutcome, Dispatcher, Handler, HandlerCompletion, HandlerError, HandlerId,
    HandlerRegistry, HandlerResult, SharedRegistry,
};
pub use filter::TopicFilter;
