use std::sync::{Arc, RwLock};

use crate::error::KvError;

// Type alias, not a new type, cannot define methods on it
pub type Pod<T> = Arc<RwLock<T>>;

pub type ResultPod<T> = Result<Pod<T>, KvError>;
pub type KvResult<T = ()> = Result<T, KvError>;
