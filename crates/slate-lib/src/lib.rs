pub mod connectivity;
pub mod filter;
pub mod io;
pub mod linenoise;
pub mod plot;
pub mod reject;
pub mod signal;
pub mod sourcespace;
pub mod specfit;
pub mod spectral;
pub mod wavelet;

pub use signal::*;
pub use spectral::*;
