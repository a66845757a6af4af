mod linux;

pub use crate::linux::{UioDevice, UioError, UioMapping};
