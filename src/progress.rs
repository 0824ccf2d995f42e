//! Progress bars for long scans, shown only in verbose mode.

use indicatif::{ProgressBar, ProgressStyle};

const COUNT_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.magenta/blue}] {pos}/{len} ({eta}) {msg}";
const SPINNER_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {pos} {msg}";

/// A bar counting items. Hidden unless `verbose`; a spinner when `total` is unknown.
pub fn bar(verbose: bool, total: Option<u64>, message: &str) -> ProgressBar {
    if !verbose {
        return ProgressBar::hidden();
    }
    let (pb, template) = match total {
        Some(len) => (ProgressBar::new(len), COUNT_TEMPLATE),
        None => (ProgressBar::new_spinner(), SPINNER_TEMPLATE),
    };
    pb.set_style(
        ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb.set_message(message.to_string());
    pb
}

