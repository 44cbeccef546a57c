use super::resolve_template;
use colored::Colorize;
use std::path::PathBuf;

pub fn handle(template: Option<PathBuf>) -> anyhow::Result<()> {
    let path = resolve_template(template)?;
    println!("{}", "Validating template...".blue());
    println!("Template: {}", path.display().to_string().cyan());

    let template = match amiflow_config::load_template(&path) {
        Ok(template) => template,
        Err(e) => {
            eprintln!("{}", "✗ Template is invalid".red().bold());
            return Err(e.into());
        }
    };

    println!("{}", "✓ Template is valid".green().bold());
    println!();
    println!("Summary:");
    println!("  Builders: {}", template.builders.len());
    for entry in &template.builders {
        println!(
            "    - {} ({}, {})",
            entry.name().cyan(),
            entry.kind.type_name(),
            entry.kind.access().region
        );
    }
    println!("  Provisioning commands: {}", template.commands().len());
    Ok(())
}
