mod catalog;
mod compiler;

pub use catalog::{
    AvatarTemplate, AvatarTemplateId, Capability, TemplateCatalog, WorldTemplate,
    WorldTemplateId,
};
pub use compiler::{load_template_catalog, CatalogError, CatalogErrorCode, SourceLocation};
