#[macro_use]
extern crate log;

pub mod supervisor;

/// Shorthand macro to return a new
/// [`TypedError`](mcp_core::error::TypedError)
///
/// Allows expressing
///
/// ```no_run
/// # use anyhow::anyhow;
/// # use mcp_core::error::{TypedError, TypedResult, ErrorKind};
/// # fn main() -> TypedResult<()>{
/// let extra_info = "problem";
/// let problem = anyhow!("a {extra_info} description");
/// return Err(TypedError::new(ErrorKind::InvalidArgument, problem));
/// # }
/// ```
///
/// as a more compact
///
/// ```no_run
/// # use mcp_core::error::TypedResult;
/// # use mcp_supervisor::problem;
/// # fn main() -> TypedResult<()>{
/// # let extra_info = "problem";
/// problem!(InvalidArgument, "a {extra_info} description");
/// # }
/// ```
#[macro_export]
macro_rules! problem {
    ($kind: expr, $($tail:tt)*) => {{
        #[allow(unused_imports)]
        use ::mcp_core::error::ErrorKind::*;
        let problem = ::anyhow::anyhow!($($tail)*);
        return ::mcp_core::error::TypedResult::Err(
            ::mcp_core::error::TypedError::new($kind, problem)
        );
    }};
}
