//! One module per pipeline step. Every step follows the same shape:
//! enablement check, input resolution, entry validation against the data,
//! computation in slate-lib, artifact persistence, context propagation,
//! metadata record.

mod aperiodic_fit;
mod connectivity;
mod epoching;
mod line_noise;
mod periodic_fit;
mod reject_epochs;
mod source_localization;
mod source_psd;
mod wavelet_threshold;
