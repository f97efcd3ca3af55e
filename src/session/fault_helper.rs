use std::sync::{Arc, Mutex};
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use crate::binder::{binder_key, ReliableChannelBinder, RequestContext};
use crate::protocol::fault::SessionError;
use crate::protocol::message::Message;
use crate::util::guard::{Guard, OwnedGuardEntry};


/// How a fault reaches the peer
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultDelivery {
    /// as the reply to the request that triggered it, falling back to a plain send if there is
    ///  no pending request
    Reply,
    /// as a new message through the binder
    Send,
}

struct FaultSend {
    binder: Arc<dyn ReliableChannelBinder>,
    context: Option<Arc<dyn RequestContext>>,
    task: Option<JoinHandle<()>>,
}

impl FaultSend {
    fn abort(self) {
        if let Some(task) = self.task {
            task.abort();
        }
        if let Some(context) = self.context {
            context.abort();
        }
        self.binder.abort();
    }
}

/// Sends terminating faults in the background, at most one per binder, and keeps track of them
///  so that closing can wait for them to complete.
///
/// A fault send enters the helper's [Guard] before it starts, so a concurrent
///  [FaultHelper::close] always waits for it. After a successful send the binder is closed; after
///  a failed send both the binder and the request context are aborted.
pub struct FaultHelper {
    delivery: FaultDelivery,
    send_timeout: Duration,
    faults: Mutex<FxHashMap<usize, FaultSend>>,
    in_flight: Arc<Guard>,
}

impl FaultHelper {
    pub fn new(delivery: FaultDelivery, send_timeout: Duration) -> FaultHelper {
        FaultHelper {
            delivery,
            send_timeout,
            faults: Default::default(),
            in_flight: Arc::new(Guard::unbounded()),
        }
    }

    pub fn delivery(&self) -> FaultDelivery {
        self.delivery
    }

    pub fn send_fault(self: &Arc<Self>, binder: Arc<dyn ReliableChannelBinder>, context: Option<Arc<dyn RequestContext>>, fault: Message) {
        self.send_fault_with_timeout(binder, context, fault, self.send_timeout)
    }

    pub fn send_fault_with_timeout(
        self: &Arc<Self>,
        binder: Arc<dyn ReliableChannelBinder>,
        context: Option<Arc<dyn RequestContext>>,
        fault: Message,
        timeout: Duration,
    ) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                debug!("no async runtime to send the fault on - aborting");
                FaultSend { binder, context, task: None }.abort();
                return;
            }
        };

        let key = binder_key(&binder);
        let mut faults = self.faults.lock().unwrap();

        if faults.contains_key(&key) {
            drop(faults);
            debug!("a fault is already being sent through this binder - dropping the second one");
            if let Some(context) = context {
                context.abort();
            }
            return;
        }

        let entry = match self.in_flight.try_enter_owned() {
            Some(entry) => entry,
            None => {
                drop(faults);
                debug!("fault helper is closing - aborting instead of sending a fault");
                FaultSend { binder, context, task: None }.abort();
                return;
            }
        };

        trace!("sending fault {} in the background", fault.action);
        let helper = self.clone();
        let task = runtime.spawn(helper.do_send(entry, key, binder.clone(), context.clone(), fault, timeout));
        faults.insert(key, FaultSend { binder, context, task: Some(task) });
    }

    async fn do_send(
        self: Arc<Self>,
        _entry: OwnedGuardEntry,
        key: usize,
        binder: Arc<dyn ReliableChannelBinder>,
        context: Option<Arc<dyn RequestContext>>,
        fault: Message,
        timeout: Duration,
    ) {
        let result = match (self.delivery, &context) {
            (FaultDelivery::Reply, Some(context)) => tokio::time::timeout(timeout, context.reply(fault, timeout)).await,
            _ => tokio::time::timeout(timeout, binder.send(fault, timeout)).await,
        };

        match result {
            Ok(Ok(())) => {
                trace!("fault sent - closing the binder");
                match tokio::time::timeout(timeout, binder.close(timeout)).await {
                    Ok(Ok(())) => {}
                    _ => binder.abort(),
                }
            }
            Ok(Err(e)) => {
                debug!("error sending fault: {:#}", e);
                Self::abort_exchange(&binder, &context);
            }
            Err(_) => {
                debug!("sending the fault timed out after {:?}", timeout);
                Self::abort_exchange(&binder, &context);
            }
        }

        self.remove(key);
    }

    fn abort_exchange(binder: &Arc<dyn ReliableChannelBinder>, context: &Option<Arc<dyn RequestContext>>) {
        if let Some(context) = context {
            context.abort();
        }
        binder.abort();
    }

    fn remove(&self, key: usize) {
        self.faults.lock().unwrap()
            .remove(&key);
    }

    /// the number of fault sends in flight
    pub fn in_flight(&self) -> usize {
        self.faults.lock().unwrap().len()
    }

    /// Rejects new fault sends, waits for those in flight to complete, and aborts those that do
    ///  not complete within the timeout.
    pub async fn close(&self, timeout: Duration) -> Result<(), SessionError> {
        let result = self.in_flight.close(timeout).await;
        if let Err(e) = &result {
            debug!("fault sends did not complete: {} - aborting them", e);
            self.abort();
        }
        result
    }

    /// Rejects new fault sends and aborts those in flight
    pub fn abort(&self) {
        self.in_flight.abort();
        let remaining = std::mem::take(&mut *self.faults.lock().unwrap());

        for (_, fault_send) in remaining {
            fault_send.abort();
        }
    }
}
