/// Native module contains the sandbox implementation
/// without using any external runtime like Docker or Runc,
/// using rlimits, process groups, cgroups and Landlock directly instead.
mod cgroup;
mod landlock;
mod process;
mod sandbox;

pub use sandbox::NativeSandboxManager;
