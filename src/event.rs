use std::any::Any;

/// Identifies an event type on a thread's dispatch table.
pub type EventId = u32;

/// Reserved event id ranges.
///
/// Ids at `0xFA00_0000` and above belong to system control, `0xFB00_0000`
/// and above to the TCP layer. Everything below is free for applications.
pub mod event_id {
    use super::EventId;

    /// Terminates the receiving event loop.
    pub const STOP: EventId = 0xFA00_0000;
    /// Carries a boxed thunk posted with `Context::post_task`.
    pub const TASK: EventId = 0xFA00_0001;
    /// Posted to a parent thread when one of its children exits.
    pub const CHILD_FINISHED: EventId = 0xFA00_0002;

    /// Carries a detached TCP channel handed to another thread.
    pub const TCP_ACCEPT: EventId = 0xFB00_0001;

    /// First id available for application-defined events.
    pub const USER: EventId = 0x0000_0001;
}

/// A tagged value dispatched through an event loop.
///
/// Events own their parameter; the consumer moves it out on dispatch with
/// [`Event::take_param`].
pub struct Event {
    id: EventId,
    param: Option<Box<dyn Any + Send>>,
}

impl Event {
    /// Creates an event without a parameter.
    pub fn new(id: EventId) -> Event {
        Event { id, param: None }
    }

    /// Creates an event carrying a typed parameter.
    pub fn with_param<T: Any + Send>(id: EventId, param: T) -> Event {
        Event {
            id,
            param: Some(Box::new(param)),
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn has_param(&self) -> bool {
        self.param.is_some()
    }

    /// Moves the parameter out of the event.
    ///
    /// Returns `None` if there is no parameter or its type does not match;
    /// a mismatched parameter is dropped.
    pub fn take_param<T: Any>(&mut self) -> Option<T> {
        self.param
            .take()
            .and_then(|param| param.downcast::<T>().ok())
            .map(|param| *param)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_moves_out_once() {
        let mut event = Event::with_param(event_id::USER, String::from("payload"));
        assert!(event.has_param());
        assert_eq!(event.take_param::<String>().unwrap(), "payload");
        assert!(event.take_param::<String>().is_none());
    }

    #[test]
    fn mismatched_param_type_is_dropped() {
        let mut event = Event::with_param(event_id::USER, 7_u32);
        assert!(event.take_param::<String>().is_none());
        assert!(!event.has_param());
    }
}
