use tera::{Context, Tera};

use crate::error::FileServerError;
use crate::listing::ListingView;

const LISTING_TEMPLATE_NAME: &str = "listing.html";
const LISTING_TEMPLATE: &str = include_str!("../templates/listing.html");

/// Turns a listing view-model into an HTML page.
pub trait ListingRenderer: Send + Sync {
    fn render(&self, view: &ListingView) -> Result<String, FileServerError>;
}

/// Built-in renderer. The template is parsed once, at construction.
pub struct TeraRenderer {
    tera: Tera,
}

impl TeraRenderer {
    pub fn new() -> Result<Self, FileServerError> {
        Self::from_template(LISTING_TEMPLATE)
    }

    /// Renderer using a caller-supplied listing template.
    pub fn from_template(template: &str) -> Result<Self, FileServerError> {
        let mut tera = Tera::default();
        // The `.html` name keeps autoescaping on.
        tera.add_raw_template(LISTING_TEMPLATE_NAME, template)?;
        Ok(Self { tera })
    }
}

impl ListingRenderer for TeraRenderer {
    fn render(&self, view: &ListingView) -> Result<String, FileServerError> {
        let context = Context::from_serialize(view)?;
        Ok(self.tera.render(LISTING_TEMPLATE_NAME, &context)?)
    }
}
