//! Scanner adapter implementations.

pub mod mock;
pub mod wazuh;

pub use mock::MockAdapter;
pub use wazuh::WazuhAdapter;
