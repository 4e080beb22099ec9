
mod chain;
pub use self::chain::*;
mod cooperative;
pub use self::cooperative::*;
mod refunds;
pub use self::refunds::*;
mod system;
pub use self::system::*;
mod zeroconf;
pub use self::zeroconf::*;
