pub mod kvm_ctx;
pub mod memory;
pub mod vcpu;
pub mod exit;
pub mod devices;
pub mod event_loop;
pub mod run;
