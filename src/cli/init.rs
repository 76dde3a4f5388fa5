use super::CliContext;
use mg_bridge::apps::cmd_init;

pub async fn execute(context: &CliContext) -> anyhow::Result<()> {
    cmd_init(&context.root, &context.config_manager).await?;
    println!(
        "mg-bridge has been initialised at {}. Add tenants with 'mg-bridge connection add' and start it with 'mg-bridge run'",
        context.root.display()
    );
    Ok(())
}
