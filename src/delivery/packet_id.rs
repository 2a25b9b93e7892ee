use std::collections::BTreeSet;

/// Lowest packet identifier in `1..=65535` not present in `in_use`.
pub fn lowest_free(in_use: &BTreeSet<u16>) -> Option<u16> {
    let mut candidate: u16 = 1;
    for &id in in_use.range(1..) {
        if id > candidate {
            break;
        }
        if candidate == u16::MAX {
            return None;
        }
        candidate += 1;
    }
    Some(candidate)
}
