use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use kindred_core::types::{EncounterId, PersonId, PhotoId};
use kindred_engine::Settings;
use kindred_store::reconcile::{self, MoveTarget};
use kindred_store::IdentityStore;

#[derive(Parser)]
#[command(name = "kindred", about = "Kindred identity store maintenance CLI")]
struct Cli {
    /// Store path; defaults to the configured database.
    #[arg(long)]
    db: Option<PathBuf>,
    /// Emit JSON instead of text.
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known people
    People,
    /// Show one person in full
    Person { id: String },
    /// Rename a person (cached names on face boxes follow)
    Rename { id: String, name: String },
    /// Merge secondary people into a primary
    MergePeople {
        primary: String,
        secondaries: Vec<String>,
        /// Concatenate notes instead of keeping only the primary's
        #[arg(long)]
        combine_notes: bool,
    },
    /// Delete a person, stripping every face-box and encounter reference
    DeletePerson { id: String },
    /// List encounters
    Encounters,
    /// Merge secondary encounters into a primary
    MergeEncounters {
        primary: String,
        secondaries: Vec<String>,
        #[arg(long)]
        combine_notes: bool,
    },
    /// Delete an encounter (photos and face boxes cascade)
    DeleteEncounter { id: String },
    /// Move photos out of an encounter; omit --to to create a new one
    MovePhotos {
        from: String,
        /// Destination encounter id
        #[arg(long)]
        to: Option<String>,
        photos: Vec<String>,
    },
    /// List tags
    Tags,
    /// Row counts
    Stats,
    /// Check that the store opens and the embedding model loads
    Doctor,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(None);
    let db_path = cli.db.clone().unwrap_or_else(|| settings.db_path.clone());
    let mut store = IdentityStore::open(&db_path)
        .with_context(|| format!("opening store at {}", db_path.display()))?;

    match cli.command {
        Commands::People => {
            let people = store.people()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&people)?);
            } else {
                for person in people {
                    let last_seen = person
                        .last_seen_at
                        .map(|t| t.format("%Y-%m-%d").to_string())
                        .unwrap_or_else(|| "never".into());
                    println!("{}  {}  (last seen {})", person.id, person.name, last_seen);
                }
            }
        }
        Commands::Person { id } => {
            let id: PersonId = id.parse()?;
            let person = store
                .person(id)?
                .with_context(|| format!("no person {id}"))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&person)?);
            } else {
                println!("{}  {}", person.id, person.name);
                if !person.relationship.is_empty() {
                    println!("  relationship: {}", person.relationship);
                }
                if !person.company.is_empty() {
                    println!("  company: {}", person.company);
                }
                if !person.notes.is_empty() {
                    println!("  notes: {}", person.notes);
                }
                println!(
                    "  samples: {}",
                    store.embeddings_for_person(person.id)?.len()
                );
            }
        }
        Commands::Rename { id, name } => {
            let id: PersonId = id.parse()?;
            store.rename_person(id, &name)?;
            println!("renamed {id} to {name}");
        }
        Commands::MergePeople {
            primary,
            secondaries,
            combine_notes,
        } => {
            let primary: PersonId = primary.parse()?;
            let secondaries = parse_ids::<PersonId>(&secondaries)?;
            reconcile::merge_people(&mut store, primary, &secondaries, combine_notes)?;
            println!("merged {} people into {primary}", secondaries.len());
        }
        Commands::DeletePerson { id } => {
            let id: PersonId = id.parse()?;
            reconcile::delete_person(&mut store, id)?;
            println!("deleted person {id}");
        }
        Commands::Encounters => {
            let encounters = store.encounters()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&encounters)?);
            } else {
                for encounter in encounters {
                    let place = if encounter.location_name.is_empty() {
                        String::new()
                    } else {
                        format!("  @ {}", encounter.location_name)
                    };
                    println!(
                        "{}  {}  {} photos, {} people{place}",
                        encounter.id,
                        encounter.occurred_at.format("%Y-%m-%d"),
                        encounter.photos.len(),
                        encounter.people.len(),
                    );
                }
            }
        }
        Commands::MergeEncounters {
            primary,
            secondaries,
            combine_notes,
        } => {
            let primary: EncounterId = primary.parse()?;
            let secondaries = parse_ids::<EncounterId>(&secondaries)?;
            reconcile::merge_encounters(&mut store, primary, &secondaries, combine_notes)?;
            println!("merged {} encounters into {primary}", secondaries.len());
        }
        Commands::DeleteEncounter { id } => {
            let id: EncounterId = id.parse()?;
            reconcile::delete_encounter(&mut store, id)?;
            println!("deleted encounter {id}");
        }
        Commands::MovePhotos { from, to, photos } => {
            let from: EncounterId = from.parse()?;
            let photo_ids = parse_ids::<PhotoId>(&photos)?;
            let target = match to {
                Some(id) => MoveTarget::Existing(id.parse()?),
                None => MoveTarget::New,
            };
            let outcome = reconcile::move_photos(&mut store, &photo_ids, from, target)?;
            println!(
                "moved {} photos to {}{}",
                photo_ids.len(),
                outcome.destination,
                if outcome.source_deleted {
                    " (source encounter deleted)"
                } else {
                    ""
                }
            );
        }
        Commands::Tags => {
            let tags = store.tags()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&tags)?);
            } else {
                for tag in tags {
                    println!("{}  {}  {}", tag.id, tag.name, tag.color);
                }
            }
        }
        Commands::Stats => {
            let stats = store.stats()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!(
                    "people: {}\nencounters: {}\nphotos: {}\nface boxes: {}\nembeddings: {}\ntags: {}",
                    stats.people,
                    stats.encounters,
                    stats.photos,
                    stats.face_boxes,
                    stats.embeddings,
                    stats.tags,
                );
            }
        }
        Commands::Doctor => {
            let stats = store.stats()?;
            println!(
                "store: ok ({} people, {} encounters, {} embeddings)",
                stats.people, stats.encounters, stats.embeddings
            );
            match kindred_core::OnnxEmbedder::load(&settings.embed_model_path()) {
                Ok(_) => println!("embedding model: ok"),
                Err(e) => println!("embedding model: {e}"),
            }
        }
    }

    Ok(())
}

fn parse_ids<T>(raw: &[String]) -> Result<Vec<T>>
where
    T: std::str::FromStr<Err = uuid::Error>,
{
    raw.iter()
        .map(|s| s.parse::<T>().with_context(|| format!("bad id: {s}")))
        .collect()
}
