use crate::models::{MeterId, PowerState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

/// Last power state echoed by each meter since startup.
pub type PowerMap = HashMap<MeterId, PowerState>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
