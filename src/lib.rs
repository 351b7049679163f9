pub mod atlas;
pub mod constants;
pub mod databases;
pub mod estimator;
pub mod healpix;
pub mod reduction;
pub mod store;
pub mod xmatch;
pub mod xmatch_errors;
