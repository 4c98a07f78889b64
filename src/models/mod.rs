pub mod approval;
pub mod certificate;
pub mod decision;
pub mod renewal;

pub use approval::*;
pub use certificate::*;
pub use decision::*;
pub use renewal::*;
