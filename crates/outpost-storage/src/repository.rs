//! Repository layer for reference data

pub mod configuration_sets;
pub mod identities;
pub mod templates;

pub use configuration_sets::DbConfigurationSetRepository;
pub use identities::DbIdentityRepository;
pub use templates::DbTemplateRepository;

pub use configuration_sets::ConfigurationSetRepository;
pub use identities::IdentityRepository;
pub use templates::TemplateRepository;
