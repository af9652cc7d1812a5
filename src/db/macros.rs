//! Bind value macros.
//!
//! Statements take anything that converts into `Binds`; mixed-type value lists
//! don't fit in an array, which is what `binds!` is for.

/// Build `Binds` from a list of values of any supported types.
///
/// # Example
///
/// ```
/// use mysql_queryable::binds;
/// use mysql_queryable::models::Binds;
///
/// let positional = binds!["name 5", 15, None::<String>];
/// assert_eq!(positional.len(), 3);
///
/// let named = binds! { "id" => 15, "name" => "name 15" };
/// assert!(matches!(named, Binds::Named(_)));
///
/// assert!(binds![].is_empty());
/// ```
#[macro_export]
macro_rules! binds {
    () => {
        $crate::models::Binds::None
    };
    ($($name:literal => $value:expr),+ $(,)?) => {{
        let mut named = ::std::collections::BTreeMap::new();
        $(
            named.insert(
                ::std::string::String::from($name),
                $crate::models::QueryParam::from($value),
            );
        )+
        $crate::models::Binds::Named(named)
    }};
    ($($value:expr),+ $(,)?) => {
        $crate::models::Binds::Positional(::std::vec![
            $($crate::models::QueryParam::from($value)),+
        ])
    };
}
