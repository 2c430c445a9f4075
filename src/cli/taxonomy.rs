use anyhow::Result;
use clap::Subcommand;

use crate::taxonomy::{
    store::{FileTaxonomyStore, TaxonomySource},
    ActivityCategory, TaxonomySnapshot,
};

use super::report::print_taxonomy;

#[derive(Subcommand, Debug)]
pub enum TaxonomyCommand {
    #[command(about = "List the activity types the classifier chooses from")]
    List,
    #[command(about = "Add an activity type. Its id is derived from the name")]
    Add {
        name: String,
        description: String,
        #[arg(long, short, value_enum)]
        category: ActivityCategory,
    },
    #[command(about = "Remove an activity type. Recorded entries keep their id")]
    Remove { id: String },
    #[command(about = "Restore the built-in activity types")]
    Reset,
}

pub async fn process_taxonomy_command(
    store: &FileTaxonomyStore,
    command: TaxonomyCommand,
) -> Result<()> {
    match command {
        TaxonomyCommand::List => {
            let snapshot = TaxonomySnapshot::new(store.activity_types().await?)?;
            print_taxonomy(&snapshot);
        }
        TaxonomyCommand::Add {
            name,
            description,
            category,
        } => {
            let definition = store.add(&name, &description, category).await?;
            println!("Added {} ({})", definition.id, definition.category);
        }
        TaxonomyCommand::Remove { id } => {
            let removed = store.remove(&id).await?;
            println!("Removed {} ({})", removed.id, removed.name);
        }
        TaxonomyCommand::Reset => {
            store.reset().await?;
            println!("Restored the default activity types");
        }
    }
    Ok(())
}
