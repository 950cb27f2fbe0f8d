pub mod error;
pub mod jobinfo;
pub mod libstate;
pub mod neterr;
pub mod nodeset;
pub mod reaper;
pub mod recovery;
