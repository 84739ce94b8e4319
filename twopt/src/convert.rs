#[allow(clippy::cast_precision_loss)]
pub fn f64_from_usize(x: usize) -> f64 {
    x as f64
}

pub fn f64_from_u32(x: u32) -> f64 {
    f64::from(x)
}
