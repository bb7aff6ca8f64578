use std::sync::{Arc, Mutex, PoisonError};

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Single-slot hook fired when the session cannot be recovered.
///
/// Last registration wins: `register` silently replaces whatever was there.
/// The callback runs with no internal lock held, so it may call back into
/// the token store, the client, or this notifier.
#[derive(Clone, Default)]
pub struct SessionEndNotifier {
    slot: Arc<Mutex<Option<Callback>>>,
}

impl SessionEndNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    pub fn unregister(&self) {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_registered(&self) -> bool {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    pub fn notify(&self) {
        let callback = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl std::fmt::Debug for SessionEndNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEndNotifier")
            .field("registered", &self.is_registered())
            .finish()
    }
}
