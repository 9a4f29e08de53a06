// Destination path generation
//
// Templates use the same date specifiers as the host's own recording paths:
// %CCYY %YY %MM %DD %hh %mm %ss and %% for a literal percent sign. Unknown
// specifiers are kept verbatim.

use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDateTime, Timelike};

/// Template used when the configured one is empty
pub const DEFAULT_FILENAME_FORMAT: &str = "%CCYY-%MM-%DD %hh-%mm-%ss";

const SPECIFIERS: &[&str] = &["%CCYY", "%YY", "%MM", "%DD", "%hh", "%mm", "%ss", "%%"];

/// Expand `format` at `now`. Spaces become underscores and characters that
/// are not valid in a file name are replaced.
pub fn format_filename(format: &str, now: &NaiveDateTime) -> String {
    let format = if format.trim().is_empty() {
        DEFAULT_FILENAME_FORMAT
    } else {
        format
    };

    let mut out = String::with_capacity(format.len() + 8);
    let mut rest = format;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        match SPECIFIERS.iter().find(|s| rest.starts_with(**s)) {
            Some(spec) => {
                out.push_str(&expand(spec, now));
                rest = &rest[spec.len()..];
            }
            None => {
                out.push('%');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);

    out.chars()
        .map(|c| match c {
            ' ' => '_',
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

fn expand(spec: &str, now: &NaiveDateTime) -> String {
    match spec {
        "%CCYY" => format!("{:04}", now.year()),
        "%YY" => format!("{:02}", now.year().rem_euclid(100)),
        "%MM" => format!("{:02}", now.month()),
        "%DD" => format!("{:02}", now.day()),
        "%hh" => format!("{:02}", now.hour()),
        "%mm" => format!("{:02}", now.minute()),
        "%ss" => format!("{:02}", now.second()),
        _ => "%".to_string(),
    }
}

/// Full destination path: `directory/<expanded template>.<extension>`
pub fn make_filename(directory: &Path, format: &str, extension: &str, now: &NaiveDateTime) -> PathBuf {
    let mut name = format_filename(format, now);
    let extension = extension.trim().trim_start_matches('.');
    if !extension.is_empty() {
        name.push('.');
        name.push_str(extension);
    }
    directory.join(name)
}
