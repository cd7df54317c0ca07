//! Request Validator for Zentinel
//!
//! An ordered chain of admission stages placed in front of a web
//! application. Each stage either answers the request itself or forwards it
//! to the next one.
//!
//! # Features
//!
//! - Search engine crawler verification via forward-confirmed reverse DNS
//! - Address-bound origin proof cookie
//! - Known-bad User-Agent signatures
//! - Header, protocol and method sanity checks
//! - Rate-adaptive CAPTCHA challenges with hCaptcha verification
//!
//! # Example
//!
//! ```ignore
//! use zentinel_request_validator::{RequestValidator, ValidatorConfig};
//!
//! let config = ValidatorConfig::from_file("validator.yaml".as_ref())?;
//! let validator = RequestValidator::from_config(&config, Arc::new(app))?;
//! let response = validator.handle(request).await;
//! ```

pub mod config;
pub mod dns;
pub mod pipeline;
pub mod provider;
pub mod request;
pub mod stages;
pub mod store;
pub mod token;

pub use config::ValidatorConfig;
pub use pipeline::{Collaborators, Pipeline, PipelineBuilder, RequestValidator};
pub use request::{Request, RequestAttributes, Response};
pub use stages::{Endpoint, Next, Stage};
