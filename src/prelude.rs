//! Prelude - Include traits for hal

pub use crate::hal::prelude::*;
pub use crate::time::U32Ext as _stm32f411_hal_time_U32Ext;
