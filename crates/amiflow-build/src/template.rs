//! Name, description and tag templating
//!
//! Templates use Tera syntax. Every build renders against the same context:
//! `build_region`, `timestamp`, `uuid`, and once the source image is known
//! `source_ami` / `source_ami_name`.

use amiflow_cloud::{CloudError, Image, Result, Tag};
use std::collections::{BTreeMap, HashMap};
use tera::{Context, Tera, Value};

pub struct NameRenderer {
    tera: Tera,
    context: Context,
}

impl NameRenderer {
    pub fn new(build_region: &str) -> Self {
        let mut tera = Tera::default();
        tera.register_filter("clean_resource_name", clean_resource_name_filter);

        let mut context = Context::new();
        context.insert("build_region", build_region);
        context.insert("timestamp", &chrono::Utc::now().timestamp().to_string());
        context.insert("uuid", &uuid::Uuid::new_v4().to_string());
        context.insert("source_ami", "");
        context.insert("source_ami_name", "");

        Self { tera, context }
    }

    pub fn set_source(&mut self, image: &Image) {
        self.context.insert("source_ami", &image.id);
        self.context.insert("source_ami_name", &image.name);
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.context.insert(key, value);
    }

    pub fn render(&mut self, template: &str) -> Result<String> {
        self.tera
            .render_str(template, &self.context)
            .map_err(|e| CloudError::Template(error_detail(&e)))
    }

    pub fn render_tags(&mut self, tags: &BTreeMap<String, String>) -> Result<Vec<Tag>> {
        tags.iter()
            .map(|(key, value)| Ok(Tag::new(self.render(key)?, self.render(value)?)))
            .collect()
    }
}

/// One-off render with explicit variables (`{{ device }}`, `{{ command }}`)
pub fn render_with(template: &str, vars: &[(&str, &str)]) -> Result<String> {
    let mut context = Context::new();
    for (key, value) in vars {
        context.insert(*key, value);
    }
    Tera::one_off(template, &context, false).map_err(|e| CloudError::Template(error_detail(&e)))
}

/// Replace characters image names may not contain with `-`
pub fn clean_resource_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "()[]./-'@_".contains(c) || c == ' ' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn clean_resource_name_filter(
    value: &Value,
    _args: &HashMap<String, Value>,
) -> tera::Result<Value> {
    let name = tera::try_get_value!("clean_resource_name", "value", String, value);
    Ok(Value::String(clean_resource_name(&name)))
}

fn error_detail(error: &tera::Error) -> String {
    let mut detail = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        detail.push_str(": ");
        detail.push_str(&cause.to_string());
        source = cause.source();
    }
    detail
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_source_variables() {
        let mut renderer = NameRenderer::new("us-east-1");
        renderer.set_source(&Image {
            id: "ami-0abc".into(),
            name: "ubuntu/jammy".into(),
            ..Default::default()
        });

        let name = renderer
            .render("golden from {{ source_ami_name | clean_resource_name }} in {{ build_region }}")
            .unwrap();
        assert_eq!(name, "golden from ubuntu/jammy in us-east-1");
    }

    #[test]
    fn test_timestamp_is_stable_within_a_build() {
        let mut renderer = NameRenderer::new("us-east-1");
        let first = renderer.render("{{ timestamp }}-{{ uuid }}").unwrap();
        let second = renderer.render("{{ timestamp }}-{{ uuid }}").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unknown_variable_is_an_error() {
        let mut renderer = NameRenderer::new("us-east-1");
        let err = renderer.render("{{ nope }}").unwrap_err();
        assert!(matches!(err, CloudError::Template(_)));
    }

    #[test]
    fn test_clean_resource_name() {
        assert_eq!(clean_resource_name("a:b*c"), "a-b-c");
        assert_eq!(clean_resource_name("web (v1.2)"), "web (v1.2)");
    }

    #[test]
    fn test_render_with_vars() {
        let out = render_with("sudo {{ command }}", &[("command", "mount /dev/xvdf1 /mnt")]).unwrap();
        assert_eq!(out, "sudo mount /dev/xvdf1 /mnt");
    }
}
