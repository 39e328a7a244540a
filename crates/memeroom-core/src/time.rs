/// Milliseconds since the Unix epoch, as carried in every outbound envelope.
pub type Timestamp = u64;

/// Current wall-clock time in Unix milliseconds.
pub fn timestamp_now() -> Timestamp {
    let dur = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    dur.as_millis() as Timestamp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_is_monotonic_enough() {
        let a = timestamp_now();
        let b = timestamp_now();
        assert!(b >= a);
        // Sanity: after 2020-01-01.
        assert!(a > 1_577_836_800_000);
    }
}
