pub mod bitmap;
pub mod registers;
pub mod support;
pub mod vcpu;
pub mod vmexit;
