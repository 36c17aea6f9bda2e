//! User-facing error display.
//!
//! Formats anyhow errors with causal chains and the help hint of the first
//! library error found in the chain.

use std::io::Write;

use permlint::PermlintError;

use crate::style;

/// Display a user-facing error to stderr.
///
/// Format:
///   error: top-level message
///     caused by: chain item 1
///
///   hint: actionable suggestion (if available)
///
/// When verbose is true, appends the full Debug representation.
pub fn display_error(err: &anyhow::Error, verbose: bool) {
    let mut stderr = std::io::stderr().lock();

    let _ = writeln!(stderr, "{}: {}", style::err_red_bold("error"), err);

    let chain: Vec<_> = err.chain().skip(1).collect();
    if chain.len() == 1 {
        let _ = writeln!(
            stderr,
            "  {}",
            style::err_dim(&format!("caused by: {}", chain[0]))
        );
    } else {
        for (i, cause) in chain.iter().enumerate() {
            let _ = writeln!(
                stderr,
                "  {}",
                style::err_dim(&format!("{}: {}", i + 1, cause))
            );
        }
    }

    let hint = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<PermlintError>().and_then(PermlintError::help));
    if let Some(hint) = hint {
        let _ = writeln!(stderr, "\n  {}: {}", style::err_cyan_bold("hint"), hint);
    }

    if verbose {
        let _ = writeln!(stderr, "\nFull error chain:\n{:?}", err);
    } else if !chain.is_empty() {
        let _ = writeln!(
            stderr,
            "\n  {}",
            style::err_dim("run with --verbose for full details")
        );
    }
}
