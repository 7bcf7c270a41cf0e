/// Backtick-quote an identifier so numeric or reserved-word names survive.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Split a file name into its base and final extension.
pub fn split_file_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) => (&name[..idx], &name[idx + 1..]),
        None => (name, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_escapes_backticks() {
        assert_eq!(quote_ident("orders"), "`orders`");
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn file_names_split_on_last_dot() {
        assert_eq!(split_file_name("orders.sql"), ("orders", "sql"));
        assert_eq!(split_file_name("t1.ibd"), ("t1", "ibd"));
        assert_eq!(split_file_name("noext"), ("noext", ""));
        assert_eq!(split_file_name("a.b.exp"), ("a.b", "exp"));
    }
}
