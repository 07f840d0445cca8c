pub(crate) mod memory_subsystem;
