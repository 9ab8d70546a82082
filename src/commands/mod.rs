pub(crate) mod ctl;
pub(crate) mod daemon;
