use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Event;

// One-shot wakeups only. There is no cancellation: callers that can go
// stale (probe waits, demo latency) carry a generation counter in the
// event they schedule and ignore firings from a superseded generation.

pub type TimerCapability = Timer<Event>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerOperation {
    NotifyAfter { duration_ms: u64 },
}

impl Operation for TimerOperation {
    type Output = TimerFired;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerFired {
    pub duration_ms: u64,
}

pub struct Timer<Ev> {
    context: CapabilityContext<TimerOperation, Ev>,
}

impl<Ev> Capability<Ev> for Timer<Ev> {
    type Operation = TimerOperation;
    type MappedSelf<MappedEv> = Timer<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static,
    {
        Timer::new(self.context.map_event(f))
    }
}

impl<Ev> Timer<Ev>
where
    Ev: 'static,
{
    pub fn new(context: CapabilityContext<TimerOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn notify_after<F>(&self, duration: Duration, make_event: F)
    where
        F: Fn(TimerFired) -> Ev + Send + Sync + 'static,
    {
        self.notify_after_ms(duration.as_millis() as u64, make_event);
    }

    pub fn notify_after_ms<F>(&self, duration_ms: u64, make_event: F)
    where
        F: Fn(TimerFired) -> Ev + Send + Sync + 'static,
    {
        let context = self.context.clone();
        self.context.spawn(async move {
            let fired = context
                .request_from_shell(TimerOperation::NotifyAfter { duration_ms })
                .await;
            context.update_app(make_event(fired));
        });
    }
}
