use drogue_bazaar::runtime;
use stormforge_operator::run;

drogue_bazaar::project!("StormForge Operator");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    runtime!(PROJECT).exec(run).await
}
