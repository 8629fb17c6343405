pub mod distribution;
pub mod grant;
pub mod resource;
pub mod scope;

pub use distribution::{Company, Distribution, Section};
pub use grant::{DelegationRule, DelegationTarget, ExceptionState, JobPermission, Owner, ResourceGrant, UserException};
pub use resource::{ActionEntity, Label, PageEntity, ResourceId, ResourceKind, ResourceNode, ServiceEntity};
pub use scope::{ControlScope, OrgPlacement, Scope, SubjectContext};
