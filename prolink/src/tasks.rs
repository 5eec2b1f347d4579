pub(crate) mod mixstatus;
pub(crate) mod status;
