use std::fmt::Write;

/// Flattens an error's `source()` chain into a single human-readable string,
/// the way panics and hook failures are logged at the session-loop boundary.
pub fn report(mut err: &dyn (std::error::Error)) -> String {
    let mut s = format!("{err}");
    while let Some(src) = err.source() {
        let _ = write!(s, "\n\nCaused by: {src}");
        err = src;
    }
    s
}
