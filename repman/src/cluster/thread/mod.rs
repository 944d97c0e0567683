use super::*;

pub mod heartbeat;
pub mod pseudo_gtid;
pub mod tick;

use crate::thread::ThreadHandle;
