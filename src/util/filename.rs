//! MySQL filename encoding for schema and table names.
//!
//! Identifiers containing characters outside the basic set are stored on
//! disk with each offending character replaced by `@` followed by four hex
//! digits of its UTF-16 code unit (`café` becomes `caf@00e9`). Backup files
//! and data-directory paths use the encoded form, so the client must apply
//! the same mapping when it builds URLs and staging paths.

/// Characters MySQL stores verbatim in identifier filenames.
fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Whether an identifier is stored under an encoded filename.
pub fn needs_encoding(name: &str) -> bool {
    name.chars().any(|c| !is_safe(c))
}

/// Encode an identifier into its on-disk filename form.
pub fn encode(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut units = [0u16; 2];

    for c in name.chars() {
        if is_safe(c) {
            out.push(c);
        } else {
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("@{unit:04x}"));
            }
        }
    }

    out
}
