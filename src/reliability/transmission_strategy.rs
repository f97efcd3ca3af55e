use std::cmp::{max, min};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::config::TransmissionSettings;
use crate::protocol::fault::{FaultCode, FaultReason, SessionError, WsrmFault};
use crate::protocol::message::{Message, SequenceHeader};
use crate::protocol::sequence_id::SequenceId;
use crate::reliability::retry_timing::RetryTiming;
use crate::reliability::sequence_range::SequenceRangeCollection;
use crate::util::deadline::deadline_after;


/// A message that is ready to be (re)sent, with its `Sequence` header already in place
#[derive(Clone, Debug)]
pub struct MessageAttemptInfo {
    pub message: Message,
    pub number: u64,
    /// 1-based
    pub attempt: u32,
    pub last_attempt: Instant,
}

struct WindowEntry {
    message: Message,
    attempts: u32,
    first_attempt: Instant,
    last_attempt: Instant,
    retry_deadline: Instant,
}

impl WindowEntry {
    fn attempt_info(&self, number: u64) -> MessageAttemptInfo {
        MessageAttemptInfo {
            message: self.message.clone(),
            number,
            attempt: self.attempts,
            last_attempt: self.last_attempt,
        }
    }
}

struct StrategyState {
    timing: RetryTiming,
    /// sent messages that were not acknowledged yet
    window: BTreeMap<u64, WindowEntry>,
    /// the highest message number assigned so far
    last: u64,
    /// the number of the sequence's final message once it is known
    last_marker: Option<u64>,
    acknowledged: SequenceRangeCollection,
    quota_remaining: Option<u64>,
    closed: bool,
}

impl StrategyState {
    fn window_capacity(&self, settings: &TransmissionSettings) -> usize {
        let size = settings.max_transfer_window_size as usize;
        if settings.flow_control_enabled {
            if let Some(quota) = self.quota_remaining {
                let quota = usize::try_from(quota).unwrap_or(usize::MAX);
                return max(1, min(size, self.window.len().saturating_add(quota)));
            }
        }
        size
    }

    fn remove_transferred(&mut self, number: u64, now: Instant) -> bool {
        match self.window.remove(&number) {
            Some(entry) => {
                if entry.attempts == 1 {
                    self.timing.on_rtt_sample(now.saturating_duration_since(entry.first_attempt));
                }
                true
            }
            None => false,
        }
    }
}


/// Book-keeping for the sending side of a single sequence: assigns message numbers, holds sent
///  messages until they are acknowledged, enforces the transfer window and decides when a message
///  is due for retransmission.
///
/// All state is behind a single lock that is never held across an `.await`. Callers waiting for
///  window space are woken through a [Notify] whenever the window changes.
pub struct TransmissionStrategy {
    id: SequenceId,
    settings: TransmissionSettings,
    state: Mutex<StrategyState>,
    window_changed: Notify,
}

impl TransmissionStrategy {
    pub fn new(id: SequenceId, settings: TransmissionSettings) -> TransmissionStrategy {
        let state = StrategyState {
            timing: RetryTiming::new(&settings),
            window: BTreeMap::default(),
            last: 0,
            last_marker: None,
            acknowledged: SequenceRangeCollection::empty(),
            quota_remaining: None,
            closed: false,
        };

        TransmissionStrategy {
            id,
            settings,
            state: Mutex::new(state),
            window_changed: Notify::new(),
        }
    }

    pub fn id(&self) -> SequenceId {
        self.id
    }

    pub fn settings(&self) -> &TransmissionSettings {
        &self.settings
    }

    /// Assigns the next message number to a message and puts it into the transfer window. This
    ///  suspends while the window is full.
    ///
    /// Returns `Ok(None)` if the strategy was closed (or aborted) before the message was
    ///  accepted.
    pub async fn add(&self, message: Message, timeout: Duration) -> Result<Option<MessageAttemptInfo>, SessionError> {
        self.do_add(message, false, timeout).await
    }

    /// Adds the sequence's final message. No message can be added afterwards.
    pub async fn add_last(&self, message: Message, timeout: Duration) -> Result<Option<MessageAttemptInfo>, SessionError> {
        self.do_add(message, true, timeout).await
    }

    async fn do_add(&self, message: Message, is_last: bool, timeout: Duration) -> Result<Option<MessageAttemptInfo>, SessionError> {
        let deadline = deadline_after(timeout);

        loop {
            let notified = self.window_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().unwrap();
                if state.closed || state.last_marker.is_some() {
                    debug!("sequence {} does not accept further messages", self.id);
                    return Ok(None);
                }

                if state.window.len() < state.window_capacity(&self.settings) {
                    let number = state.last + 1;
                    if number > self.settings.reliable_messaging_version.max_message_number() {
                        return Err(SessionError::Fault(WsrmFault::MessageNumberRollover { id: self.id }));
                    }

                    let now = Instant::now();
                    let message = message.with_sequence(SequenceHeader {
                        id: self.id,
                        number,
                        last_message: is_last,
                    });
                    let entry = WindowEntry {
                        message,
                        attempts: 1,
                        first_attempt: now,
                        last_attempt: now,
                        retry_deadline: now + state.timing.retry_timeout(1),
                    };
                    let attempt_info = entry.attempt_info(number);

                    state.window.insert(number, entry);
                    state.last = number;
                    if let Some(quota) = state.quota_remaining.as_mut() {
                        *quota = quota.saturating_sub(1);
                    }
                    if is_last {
                        state.last_marker = Some(number);
                    }
                    trace!("added message #{} to sequence {}, {} in flight", number, self.id, state.window.len());
                    return Ok(Some(attempt_info));
                }
                trace!("transfer window of sequence {} is full - waiting", self.id);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(SessionError::Timeout(timeout));
            }
        }
    }

    /// Marks the highest message number sent so far as the sequence's final message (1.1 style,
    ///  where no separate last message exists). Returns false if the last message was known
    ///  before.
    pub fn set_last(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.last_marker.is_some() {
            return false;
        }
        state.last_marker = Some(state.last);
        drop(state);

        self.window_changed.notify_waiters();
        true
    }

    pub fn last(&self) -> u64 {
        self.state.lock().unwrap().last
    }

    pub fn last_marker(&self) -> Option<u64> {
        self.state.lock().unwrap().last_marker
    }

    pub fn acknowledged(&self) -> SequenceRangeCollection {
        self.state.lock().unwrap().acknowledged.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().window.len()
    }

    /// Checks an acknowledgement against what was sent and previously acknowledged, returning
    ///  `(invalid, inconsistent)`:
    /// * invalid: the peer acknowledged a number that was never sent
    /// * inconsistent: the peer 'forgot' a number it acknowledged previously
    pub fn process_acknowledgement(&self, ranges: &SequenceRangeCollection) -> (bool, bool) {
        let state = self.state.lock().unwrap();

        let invalid = ranges.upper_bound()
            .map(|upper| upper > state.last)
            .unwrap_or(false);
        let inconsistent = !ranges.is_superset_of(&state.acknowledged);

        (invalid, inconsistent)
    }

    /// Releases all acknowledged messages from the window. Returns true if unacknowledged
    ///  messages remain.
    pub fn process_transferred_ranges(&self, ranges: &SequenceRangeCollection, quota_remaining: Option<u64>) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();

        let acked_in_window = state.window.keys()
            .filter(|n| ranges.contains(**n))
            .cloned()
            .collect::<Vec<_>>();
        for number in acked_in_window {
            state.remove_transferred(number, now);
        }

        state.acknowledged = state.acknowledged.merge(ranges);
        self.after_transferred(state, quota_remaining)
    }

    /// Single-number variant of [TransmissionStrategy::process_transferred_ranges], for replies
    ///  that acknowledge exactly the request they answer.
    pub fn process_transferred_number(&self, number: u64, quota_remaining: Option<u64>) -> bool {
        if number == 0 {
            return self.in_flight() > 0;
        }

        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        state.remove_transferred(number, now);
        state.acknowledged = state.acknowledged.merge_number(number);
        self.after_transferred(state, quota_remaining)
    }

    fn after_transferred(&self, mut state: std::sync::MutexGuard<StrategyState>, quota_remaining: Option<u64>) -> bool {
        if self.settings.flow_control_enabled && quota_remaining.is_some() {
            state.quota_remaining = quota_remaining;
        }
        let more_to_send = !state.window.is_empty();
        trace!("sequence {}: acknowledged {}, {} still in flight", self.id, state.acknowledged, state.window.len());
        drop(state);

        self.window_changed.notify_waiters();
        more_to_send
    }

    /// Returns the unacknowledged message that is most overdue for retransmission, if any, and
    ///  records the new attempt. Running out of retries for any message is fatal to the sequence.
    pub fn get_message_info_for_retry(&self, now: Instant) -> Result<Option<MessageAttemptInfo>, WsrmFault> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Ok(None);
        }

        let due = state.window.iter()
            .filter(|(_, e)| e.retry_deadline <= now)
            .min_by_key(|(n, e)| (e.retry_deadline, **n))
            .map(|(n, _)| *n);

        let number = match due {
            Some(n) => n,
            None => return Ok(None),
        };

        let retry_timeout = {
            let entry = &state.window[&number];
            if entry.attempts >= self.settings.max_retry_count {
                debug!("message #{} on sequence {} was sent {} times without acknowledgement", number, self.id, entry.attempts);
                return Err(WsrmFault::terminated(Some(self.id), FaultCode::Receiver, FaultReason::RetryCountExceeded));
            }
            state.timing.retry_timeout(entry.attempts + 1)
        };

        let entry = state.window.get_mut(&number)
            .expect("number was taken from the window while holding the lock");
        entry.attempts += 1;
        entry.last_attempt = now;
        entry.retry_deadline = now + retry_timeout;
        Ok(Some(entry.attempt_info(number)))
    }

    pub fn next_retry_deadline(&self) -> Option<Instant> {
        let state = self.state.lock().unwrap();
        if state.closed {
            return None;
        }
        state.window.values()
            .map(|e| e.retry_deadline)
            .min()
    }

    /// true once the final message is known and everything up to it is acknowledged
    pub fn done_transmitting(&self) -> bool {
        let state = self.state.lock().unwrap();
        match state.last_marker {
            Some(_) => state.window.is_empty(),
            None => false,
        }
    }

    /// Stops accepting new messages and wakes all callers waiting for window space. Messages
    ///  that are in flight stay available for retries.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.window_changed.notify_waiters();
    }

    /// Like [TransmissionStrategy::close], but additionally releases all buffered messages
    pub fn abort(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            state.window.clear();
        }
        self.window_changed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use bytes::Bytes;
    use rstest::rstest;
    use crate::protocol::version::ReliableMessagingVersion;
    use crate::reliability::sequence_range::SequenceRange;
    use super::*;

    fn settings(window: u32, flow_control: bool) -> TransmissionSettings {
        TransmissionSettings {
            reliable_messaging_version: ReliableMessagingVersion::V1_1,
            max_transfer_window_size: window,
            flow_control_enabled: flow_control,
            max_retry_count: 3,
            initial_rtt: Duration::from_millis(100),
            min_rto: Duration::from_millis(50),
            max_rto: Duration::from_secs(60),
        }
    }

    fn msg(n: u8) -> Message {
        Message::new("urn:app/Echo", Bytes::from(vec![n]))
    }

    fn ranges(raw: &[(u64, u64)]) -> SequenceRangeCollection {
        SequenceRangeCollection::from_ranges(raw.iter().map(|&(l, u)| SequenceRange::new(l, u)))
    }

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn test_add_assigns_numbers() {
        let strategy = TransmissionStrategy::new(SequenceId::new_unique(), settings(8, false));

        for expected in 1..=3 {
            let info = strategy.add(msg(expected as u8), TIMEOUT).await.unwrap().unwrap();
            assert_eq!(info.number, expected);
            assert_eq!(info.attempt, 1);
            let header = info.message.sequence.unwrap();
            assert_eq!(header.number, expected);
            assert_eq!(header.id, strategy.id());
            assert!(!header.last_message);
        }
        assert_eq!(strategy.last(), 3);
        assert_eq!(strategy.in_flight(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_full_times_out() {
        let strategy = TransmissionStrategy::new(SequenceId::new_unique(), settings(2, false));

        strategy.add(msg(1), TIMEOUT).await.unwrap().unwrap();
        strategy.add(msg(2), TIMEOUT).await.unwrap().unwrap();
        assert_eq!(strategy.add(msg(3), Duration::from_secs(1)).await.unwrap_err(), SessionError::Timeout(Duration::from_secs(1)));
        assert_eq!(strategy.in_flight(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_backpressure() {
        let strategy = Arc::new(TransmissionStrategy::new(SequenceId::new_unique(), settings(1, false)));
        strategy.add(msg(1), TIMEOUT).await.unwrap().unwrap();

        let cloned = strategy.clone();
        let second = tokio::spawn(async move {
            cloned.add(msg(2), TIMEOUT).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!second.is_finished());
        assert_eq!(strategy.in_flight(), 1);

        assert!(!strategy.process_transferred_number(1, None));
        let info = second.await.unwrap().unwrap().unwrap();
        assert_eq!(info.number, 2);
        assert_eq!(strategy.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_releases_waiting_add() {
        let strategy = Arc::new(TransmissionStrategy::new(SequenceId::new_unique(), settings(1, false)));
        strategy.add(msg(1), TIMEOUT).await.unwrap().unwrap();

        let cloned = strategy.clone();
        let second = tokio::spawn(async move {
            cloned.add(msg(2), TIMEOUT).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        strategy.close();
        assert!(second.await.unwrap().unwrap().is_none());
        assert!(strategy.add(msg(3), TIMEOUT).await.unwrap().is_none());
    }

    #[rstest]
    #[case::empty(vec![], vec![], false, false)]
    #[case::first(vec![], vec![(1,2)], false, false)]
    #[case::grown(vec![(1,2)], vec![(1,4)], false, false)]
    #[case::same(vec![(1,2)], vec![(1,2)], false, false)]
    #[case::gap_filled(vec![(1,1), (3,3)], vec![(1,3)], false, false)]
    #[case::beyond_sent(vec![], vec![(1,5)], true, false)]
    #[case::forgotten(vec![(1,3)], vec![(2,3)], false, true)]
    #[case::both(vec![(1,3)], vec![(4,5)], true, true)]
    fn test_process_acknowledgement(#[case] previous: Vec<(u64, u64)>, #[case] ack: Vec<(u64, u64)>, #[case] invalid: bool, #[case] inconsistent: bool) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let strategy = TransmissionStrategy::new(SequenceId::new_unique(), settings(8, false));
            for n in 1..=4 {
                strategy.add(msg(n), TIMEOUT).await.unwrap().unwrap();
            }
            strategy.process_transferred_ranges(&ranges(&previous), None);

            assert_eq!(strategy.process_acknowledgement(&ranges(&ack)), (invalid, inconsistent));
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_transferred_ranges() {
        let strategy = TransmissionStrategy::new(SequenceId::new_unique(), settings(8, false));
        for n in 1..=4 {
            strategy.add(msg(n), TIMEOUT).await.unwrap().unwrap();
        }

        assert!(strategy.process_transferred_ranges(&ranges(&[(1,1), (3,3)]), None));
        assert_eq!(strategy.in_flight(), 2);
        assert!(!strategy.process_transferred_ranges(&ranges(&[(1,4)]), None));
        assert_eq!(strategy.in_flight(), 0);
        assert_eq!(strategy.acknowledged(), ranges(&[(1,4)]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_schedule_and_retry_count() {
        let strategy = TransmissionStrategy::new(SequenceId::new_unique(), settings(8, false));
        strategy.add(msg(1), TIMEOUT).await.unwrap().unwrap();

        // initial rto is 100ms + 4*50ms
        assert!(strategy.get_message_info_for_retry(Instant::now()).unwrap().is_none());
        assert_eq!(strategy.next_retry_deadline(), Some(Instant::now() + Duration::from_millis(300)));

        tokio::time::advance(Duration::from_millis(300)).await;
        let retry = strategy.get_message_info_for_retry(Instant::now()).unwrap().unwrap();
        assert_eq!(retry.number, 1);
        assert_eq!(retry.attempt, 2);
        assert_eq!(strategy.next_retry_deadline(), Some(Instant::now() + Duration::from_millis(600)));

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(strategy.get_message_info_for_retry(Instant::now()).unwrap().unwrap().attempt, 3);

        tokio::time::advance(Duration::from_millis(1200)).await;
        let fault = strategy.get_message_info_for_retry(Instant::now()).unwrap_err();
        assert_eq!(fault.reason(), Some(FaultReason::RetryCountExceeded));
        assert_eq!(fault.sequence_id(), Some(strategy.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_picks_most_overdue() {
        let strategy = TransmissionStrategy::new(SequenceId::new_unique(), settings(8, false));
        strategy.add(msg(1), TIMEOUT).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        strategy.add(msg(2), TIMEOUT).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        let now = Instant::now();
        assert_eq!(strategy.get_message_info_for_retry(now).unwrap().unwrap().number, 1);
        assert_eq!(strategy.get_message_info_for_retry(now).unwrap().unwrap().number, 2);
        assert!(strategy.get_message_info_for_retry(now).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_last_and_done_transmitting() {
        let strategy = TransmissionStrategy::new(SequenceId::new_unique(), settings(8, false));
        strategy.add(msg(1), TIMEOUT).await.unwrap().unwrap();
        let last = strategy.add_last(msg(0), TIMEOUT).await.unwrap().unwrap();
        assert!(last.message.sequence.unwrap().last_message);
        assert_eq!(strategy.last_marker(), Some(2));
        assert!(!strategy.done_transmitting());

        assert!(strategy.add(msg(3), TIMEOUT).await.unwrap().is_none());

        strategy.process_transferred_ranges(&ranges(&[(1,2)]), None);
        assert!(strategy.done_transmitting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_last() {
        let strategy = TransmissionStrategy::new(SequenceId::new_unique(), settings(8, false));
        strategy.add(msg(1), TIMEOUT).await.unwrap().unwrap();

        assert!(strategy.set_last());
        assert!(!strategy.set_last());
        assert_eq!(strategy.last_marker(), Some(1));
        assert!(!strategy.done_transmitting());

        strategy.process_transferred_number(1, None);
        assert!(strategy.done_transmitting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_sequence_set_last() {
        let strategy = TransmissionStrategy::new(SequenceId::new_unique(), settings(8, false));
        assert!(strategy.set_last());
        assert!(strategy.done_transmitting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollover() {
        let strategy = TransmissionStrategy::new(SequenceId::new_unique(), settings(8, false));
        strategy.state.lock().unwrap().last = i64::MAX as u64 - 1;

        assert_eq!(strategy.add(msg(1), TIMEOUT).await.unwrap().unwrap().number, i64::MAX as u64);
        let err = strategy.add(msg(2), TIMEOUT).await.unwrap_err();
        assert_eq!(err.fault().map(|f| f.subcode()), Some("MessageNumberRollover"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_limits_window() {
        let strategy = TransmissionStrategy::new(SequenceId::new_unique(), settings(8, true));
        strategy.add(msg(1), TIMEOUT).await.unwrap().unwrap();
        strategy.add(msg(2), TIMEOUT).await.unwrap().unwrap();

        // the receiver has room for one more message
        strategy.process_transferred_number(1, Some(1));
        strategy.add(msg(3), TIMEOUT).await.unwrap().unwrap();
        assert!(strategy.add(msg(4), Duration::from_millis(100)).await.is_err());

        // a receiver without room still allows a single probe when nothing is in flight
        strategy.process_transferred_ranges(&ranges(&[(1,3)]), Some(0));
        strategy.add(msg(4), TIMEOUT).await.unwrap().unwrap();
        assert!(strategy.add(msg(5), Duration::from_millis(100)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_ignored_without_flow_control() {
        let strategy = TransmissionStrategy::new(SequenceId::new_unique(), settings(3, false));
        strategy.process_transferred_ranges(&SequenceRangeCollection::empty(), Some(0));
        for n in 1..=3 {
            strategy.add(msg(n), TIMEOUT).await.unwrap().unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_clears_window() {
        let strategy = TransmissionStrategy::new(SequenceId::new_unique(), settings(8, false));
        strategy.add(msg(1), TIMEOUT).await.unwrap().unwrap();
        strategy.abort();
        assert!(strategy.is_closed());
        assert_eq!(strategy.in_flight(), 0);
        assert_eq!(strategy.next_retry_deadline(), None);
    }
}
