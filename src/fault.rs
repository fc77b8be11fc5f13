//! Handler faults and the process-level hook that observes them.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A handler panicked while serving a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFault {
    message_type: String,
    panic: String,
}

impl HandlerFault {
    pub(crate) fn from_panic(message_type: impl Into<String>, payload: &(dyn Any + Send)) -> Self {
        Self {
            message_type: message_type.into(),
            panic: panic_message(payload),
        }
    }

    /// Message type whose handler failed.
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Text of the panic payload.
    pub fn panic_message(&self) -> &str {
        &self.panic
    }
}

impl fmt::Display for HandlerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "handler for {:?} panicked: {}",
            self.message_type, self.panic
        )
    }
}

/// Extract the text of a panic payload (`String` or `&'static str`).
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Callback invoked for every handler fault.
///
/// Faults are always logged; the hook lets the host application count or
/// escalate them. The default hook does nothing.
#[derive(Clone)]
pub struct FaultHook(Arc<dyn Fn(&HandlerFault) + Send + Sync>);

impl FaultHook {
    pub fn new<F>(hook: F) -> Self
    where
        F: Fn(&HandlerFault) + Send + Sync + 'static,
    {
        Self(Arc::new(hook))
    }

    pub fn report(&self, fault: &HandlerFault) {
        (self.0)(fault)
    }
}

impl Default for FaultHook {
    fn default() -> Self {
        Self::new(|_| {})
    }
}

impl fmt::Debug for FaultHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FaultHook(<fn>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_panic_message_formats() {
        let fault = HandlerFault::from_panic("echo", &"boom");
        assert_eq!(fault.panic_message(), "boom");

        let owned: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        let fault = HandlerFault::from_panic("echo", owned.as_ref());
        assert_eq!(fault.panic_message(), "owned boom");

        let fault = HandlerFault::from_panic("echo", &5_u32);
        assert_eq!(fault.panic_message(), "non-string panic payload");
    }

    #[test]
    fn test_hook_receives_fault() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let hook = FaultHook::new(move |fault| {
            sink.lock().unwrap().push(fault.message_type().to_string());
        });

        hook.report(&HandlerFault::from_panic("echo", &"boom"));
        assert_eq!(*seen.lock().unwrap(), vec!["echo".to_string()]);
    }

    #[test]
    fn test_display() {
        let fault = HandlerFault::from_panic("echo", &"boom");
        assert_eq!(fault.to_string(), "handler for \"echo\" panicked: boom");
    }
}
