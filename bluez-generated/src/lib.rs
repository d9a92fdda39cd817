mod adapter1;
mod agentmanager1;
mod device1;
mod gattmanager1;
mod leadvertisingmanager1;

pub use adapter1::{OrgBluezAdapter1, OrgBluezAdapter1Properties};
pub use agentmanager1::OrgBluezAgentManager1;
pub use device1::{OrgBluezDevice1, OrgBluezDevice1Properties};
pub use gattmanager1::OrgBluezGattManager1;
pub use leadvertisingmanager1::OrgBluezLEAdvertisingManager1;
