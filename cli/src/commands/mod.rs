mod inspect;
mod serve;

pub use inspect::{InspectArgs, run_inspect};
pub use serve::{ServeArgs, run_serve};
