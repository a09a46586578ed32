//! Terminal progress indicators.

use indicatif::{ProgressBar, ProgressStyle};

/// A bar over `len` steps, or a hidden one when progress output is disabled.
pub fn bar(len: usize, visible: bool, message: &str) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len.max(1) as u64);
    if let Ok(style) =
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>5}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb.set_message(message.to_string());
    pb
}
