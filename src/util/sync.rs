use std::sync::{Mutex, MutexGuard};


/// Locks a mutex, recovering the data if a previous holder panicked. None of the data guarded
///  this way can be left inconsistent by a panic halfway through an update.
pub fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
