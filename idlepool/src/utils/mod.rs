pub(crate) mod scope_guard;
pub(crate) use scope_guard::ScopeGuard;

pub(crate) mod wait_group;
pub(crate) use wait_group::WaitGroup;
