use std::time::Duration;
use tokio::time::Instant;

/// About 30 years, the same horizon tokio uses for timeouts that do not fit into an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// The instant `timeout` from now. Timeouts that overflow an `Instant` (e.g. `Duration::MAX`
///  used as 'no timeout') saturate to a point in the far future.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

pub fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_after() {
        let now = Instant::now();
        assert_eq!(deadline_after(Duration::from_secs(3)), now + Duration::from_secs(3));
        assert_eq!(deadline_after(Duration::MAX), now + FAR_FUTURE);
        assert_eq!(remaining(deadline_after(Duration::MAX)), FAR_FUTURE);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(remaining(now + Duration::from_secs(3)), Duration::ZERO);
    }
}
