#![allow(dead_code)]

use messaging::{handler_fn, BoxError, BrokerEndpoint, Bytes, MessageHandler, MemoryBroker};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn endpoint() -> BrokerEndpoint {
    BrokerEndpoint::new(["mem://local"])
}

pub fn transport(broker: &MemoryBroker) -> Arc<dyn messaging::Transport> {
    Arc::new(broker.transport())
}

/// Polls `condition` every 10ms of (possibly paused) time.
pub async fn wait_until(limit: Duration, what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Records every payload it sees and fails the first `failures` calls.
#[derive(Clone, Default)]
pub struct Recorder {
    pub calls: Arc<AtomicU32>,
    pub seen: Arc<Mutex<Vec<Bytes>>>,
}

impl Recorder {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Bytes> {
        self.seen.lock().unwrap().clone()
    }

    pub fn handler(&self, failures: u32) -> impl MessageHandler {
        let recorder = self.clone();
        handler_fn("recorder", move |payload: Bytes| {
            let recorder = recorder.clone();
            async move {
                recorder.seen.lock().unwrap().push(payload);
                let call = recorder.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call <= failures {
                    Err::<(), BoxError>(format!("failure {call}").into())
                } else {
                    Ok(())
                }
            }
        })
    }
}
