// Task DSL - tasks, conditions and variables

pub mod builder;
pub mod condition;
pub mod vars;

pub use builder::{
    capture, chmod, chown, compose, copy, docker, download, noop, package, rm, rsync, run,
    svc, symlink, tasks, upload, wait_file, wait_http, wait_port, wibu_apply, wibu_generate,
    wibu_info, wibu_list, Action, ContainerState, PackageState, ServiceState, Task, TaskBuilder,
};
pub use condition::{
    all, always, any, if_equals, if_not, if_set, if_true, never, Condition,
};
pub use vars::VarBag;
