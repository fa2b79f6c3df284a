//! Timer names for functions whose identity is only known at call time.

use std::borrow::Cow;

/// Name of the catch-all slot for functions the host cannot identify.
pub const USER_FUNC_FALLBACK: &str = "UserFuncFallback";

/// Name shared by closures restored from serialized images, which carry no
/// source reference.
pub const DESERIALIZED: &str = "(deserialized)";

/// What the host knows about a called function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionIdentity<'a> {
    /// Defined in a source file at `line`.
    Source { file: &'a str, line: u32 },
    /// Called through a symbol with no usable source reference.
    Symbol(&'a str),
    /// No name and no source; `context` is whatever the host can add
    /// (typically the enclosing call).
    Anonymous { context: Option<&'a str> },
    Deserialized,
    Unknown,
}

impl<'a> FunctionIdentity<'a> {
    /// Pick the most specific identity available: a source location wins
    /// over a symbol, a symbol over the deserialized sentinel.
    pub fn describe(
        source: Option<(&'a str, u32)>,
        symbol: Option<&'a str>,
        deserialized: bool,
    ) -> Self {
        match (source, symbol) {
            (Some((file, line)), _) if !file.is_empty() => FunctionIdentity::Source { file, line },
            (_, Some(sym)) if !sym.is_empty() => FunctionIdentity::Symbol(sym),
            _ if deserialized => FunctionIdentity::Deserialized,
            _ => FunctionIdentity::Anonymous { context: None },
        }
    }

    pub fn timer_name(&self) -> Cow<'a, str> {
        match *self {
            FunctionIdentity::Source { file, line } => Cow::Owned(format!("{file}:{line}")),
            FunctionIdentity::Symbol(sym) => Cow::Borrowed(sym),
            FunctionIdentity::Anonymous { context: Some(ctx) } => {
                Cow::Owned(format!("(anon {ctx})"))
            }
            FunctionIdentity::Anonymous { context: None } => Cow::Borrowed("(anon)"),
            FunctionIdentity::Deserialized => Cow::Borrowed(DESERIALIZED),
            FunctionIdentity::Unknown => Cow::Borrowed(USER_FUNC_FALLBACK),
        }
    }
}
