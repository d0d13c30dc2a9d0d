//! XP and level arithmetic
//!
//! Pure functions over a non-negative total XP. Levels run 1..=10, each
//! level spans 10,000 XP and the last level absorbs everything above 90,000.

pub const XP_PER_LEVEL: i64 = 10_000;
pub const MAX_LEVEL: i64 = 10;

/// Every completed calibration round awards the same amount, whatever the challenge type
pub const CALIBRATION_XP_REWARD: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelCheck {
    pub leveled_up: bool,
    pub old_level: i64,
    pub new_level: i64,
}

/// Level for a total XP, always in 1..=10
pub fn calculate_level(total_xp: i64) -> i64 {
    let xp = total_xp.max(0);
    (xp / XP_PER_LEVEL + 1).min(MAX_LEVEL)
}

/// XP accumulated inside the current level
pub fn current_level_xp(total_xp: i64) -> i64 {
    let xp = total_xp.max(0);
    if calculate_level(xp) < MAX_LEVEL {
        xp % XP_PER_LEVEL
    } else {
        xp - (MAX_LEVEL - 1) * XP_PER_LEVEL
    }
}

/// XP needed to fill the current level
pub fn xp_needed_for_current_level() -> i64 {
    XP_PER_LEVEL
}

/// Compare levels before and after an XP gain (`new_xp >= old_xp`)
pub fn check_level_up(old_xp: i64, new_xp: i64) -> LevelCheck {
    let old_level = calculate_level(old_xp);
    let new_level = calculate_level(new_xp);
    LevelCheck {
        leveled_up: new_level > old_level,
        old_level,
        new_level,
    }
}

/// Progress inside the current level, clamped to 0..=10000 for the matrix
pub fn level_progress(total_xp: i64) -> u32 {
    current_level_xp(total_xp).clamp(0, XP_PER_LEVEL) as u32
}
