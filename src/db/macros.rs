//! Macros shared by the backend implementations and callers.
//!
//! `params!` builds a positional parameter list from plain Rust values.
//! `bind_params!` expands the per-parameter `bind` chain once so that the
//! PostgreSQL and SQLite backends stay line-for-line parallel.

/// Build a `Vec<QueryParam>` from a list of values convertible into
/// [`QueryParam`](crate::db::QueryParam).
///
/// # Example
///
/// ```ignore
/// let params = params!["ada@example.com", 42, None::<String>];
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::db::QueryParam>::new()
    };
    ($($value:expr),+ $(,)?) => {
        ::std::vec![$($crate::db::QueryParam::from($value)),+]
    };
}

/// Bind every [`QueryParam`](crate::db::QueryParam) in a slice to a `sqlx`
/// query or `query_as`, in order.
///
/// `null = <expr>` is the value bound for [`QueryParam::Null`](crate::db::QueryParam::Null).
/// The `json_as_text` form binds JSON documents as their serialized text for
/// backends without a native JSON column type.
#[macro_export]
macro_rules! bind_params {
    (@bind $query:expr, $params:expr, $null:expr, |$json:ident| $json_bind:expr) => {{
        let mut query = $query;
        for param in $params {
            query = match param {
                $crate::db::QueryParam::Null => query.bind($null),
                $crate::db::QueryParam::Bool(v) => query.bind(*v),
                $crate::db::QueryParam::Int(v) => query.bind(*v),
                $crate::db::QueryParam::Float(v) => query.bind(*v),
                $crate::db::QueryParam::String(v) => query.bind(v.as_str()),
                $crate::db::QueryParam::Bytes(v) => query.bind(v.as_slice()),
                $crate::db::QueryParam::Timestamp(v) => query.bind(*v),
                $crate::db::QueryParam::Json($json) => query.bind($json_bind),
            };
        }
        query
    }};
    ($query:expr, $params:expr, null = $null:expr) => {
        $crate::bind_params!(@bind $query, $params, $null, |v| ::sqlx::types::Json(v))
    };
    ($query:expr, $params:expr, null = $null:expr, json_as_text) => {
        $crate::bind_params!(@bind $query, $params, $null, |v| v.to_string())
    };
}

pub use bind_params;
pub use params;
