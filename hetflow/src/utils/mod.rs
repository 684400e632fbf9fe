mod scope_guard;
pub(crate) use scope_guard::ScopeGuard;

mod spin;
pub(crate) use spin::SpinLock;

/// Renders a panic payload the way the default hook does.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}
