//! The 8-pixel residual pattern shared by immature and active points.

/// Number of pixels in the residual pattern.
pub const PATTERN_COUNT: usize = 8;

/// Border (in pixels) the pattern needs around a point location.
pub const PATTERN_PADDING: i32 = 2;

/// Pattern offsets around the point, a spread cross covering a 5×5
/// neighbourhood.
#[rustfmt::skip]
pub const PATTERN: [[i32; 2]; PATTERN_COUNT] = [
    [0, -2],
    [-1, -1],
    [1, -1],
    [-2, 0],
    [0, 0],
    [2, 0],
    [-1, 1],
    [0, 2],
];
