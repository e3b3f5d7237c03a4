//! 协调器共享状态：接管闸门与意图延续存储
//!
//! 二者都按会话键分区，由编排器（读）与管理端（写）共用。

use crate::core::{CarryOverSettings, IntentCarryOver, TakeoverGate};

pub struct CoordinatorState {
    pub takeover: TakeoverGate,
    pub carry_over: IntentCarryOver,
}

impl CoordinatorState {
    pub fn new(carry_over: CarryOverSettings) -> Self {
        Self {
            takeover: TakeoverGate::new(),
            carry_over: IntentCarryOver::new(carry_over),
        }
    }
}

impl Default for CoordinatorState {
    fn default() -> Self {
        Self::new(CarryOverSettings::default())
    }
}
