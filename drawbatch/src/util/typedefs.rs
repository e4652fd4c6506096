/// A string which uses SmallString optimization for strings shorter than 23 characters.
pub type SsoString = smartstring::SmartString<smartstring::LazyCompact>;
/// Hash map designed for small keys
pub type FastHashMap<K, V> = rustc_hash::FxHashMap<K, V>;
pub type FastHashSet<K> = rustc_hash::FxHashSet<K>;

#[macro_export]
/// Similar to the [`format`] macro, but creates a [`SsoString`].
macro_rules! format_sso {
    ($($arg:tt)*) => {{
        use std::fmt::Write as _;
        let mut buffer = $crate::util::typedefs::SsoString::new();
        let result = write!(buffer, $($arg)*);
        debug_assert!(result.is_ok(), "unexpected formatting error");
        buffer
    }};
}

#[cfg(test)]
mod tests {
    use std::fmt;

    struct Fails;

    impl fmt::Display for Fails {
        fn fmt(&self, _: &mut fmt::Formatter<'_>) -> fmt::Result {
            Err(fmt::Error)
        }
    }

    #[test]
    fn format_sso_formats_inline() {
        let role = "indirect";
        let label = crate::format_sso!("{role} buffer {}", 3);
        assert_eq!(label.as_str(), "indirect buffer 3");
        assert!(label.is_inline());
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "unexpected formatting error"))]
    fn format_sso_reports_formatting_errors() {
        let _ = crate::format_sso!("{}", Fails);
    }
}
