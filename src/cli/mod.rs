use std::io::Write;
use std::sync::Arc;

use clap::Subcommand;
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::{
    config::context::DataContext,
    data_types::{record_from_json, record_to_json, Direction, Record},
    identity::IdentityError,
    repository::interface,
    schema::ValueError,
};

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the fields of the table
    Describe,

    /// Print the record with the given identifier
    Get { id: String },

    /// Print records, optionally filtered and one page at a time
    List {
        /// Fields to sort by, in order
        #[clap(long)]
        sort: Vec<String>,

        /// Sort in descending order
        #[clap(long)]
        desc: bool,

        /// Filter such as `name~A% && count>=3`
        #[clap(long)]
        filter: Option<String>,

        /// 0-based page to print
        #[clap(long)]
        page: Option<u64>,

        #[clap(long, default_value_t = 20)]
        size: u64,
    },

    /// Insert a JSON object, or an array of them
    Insert { json: String },

    /// Update from a JSON object, or an array of them, holding the key fields
    Update { json: String },

    /// Delete the records with the given identifiers
    Delete {
        #[clap(required = true)]
        ids: Vec<String>,
    },
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Repository(#[from] interface::Error),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("Invalid record: {0}")]
    Value(#[from] ValueError),

    #[error("Invalid JSON input: {0}")]
    Json(String),

    #[error("No record with identifier {0:?}")]
    NotFound(String),

    #[error("Error writing output: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub fn is_client_error(&self) -> bool {
        match self {
            CliError::Repository(e) => e.is_client_error(),
            CliError::Identity(_)
            | CliError::Value(_)
            | CliError::Json(_)
            | CliError::NotFound(_) => true,
            CliError::Io(_) => false,
        }
    }
}

pub struct TablefrontCli {
    ctx: Arc<DataContext>,
}

impl TablefrontCli {
    pub fn new(ctx: Arc<DataContext>) -> Self {
        TablefrontCli { ctx }
    }

    /// Run one command, writing its output as JSON lines.
    pub async fn run<W: Write>(&self, command: &Command, out: &mut W) -> Result<(), CliError> {
        let repository = &self.ctx.repository;

        match command {
            Command::Describe => {
                for field in self.ctx.fields.iter() {
                    let line = json!({
                        "name": field.name,
                        "type": field.r#type.to_string(),
                        "column": field.column.name,
                        "key": field.is_key(),
                        "nullable": field.column.nullable,
                        "autoIncrement": field.column.auto_increment,
                    });
                    writeln!(out, "{line}")?;
                }
            }
            Command::Get { id } => {
                let key = self.ctx.identity.parse(id)?;
                let record = repository
                    .find(&key)
                    .await?
                    .ok_or_else(|| CliError::NotFound(id.clone()))?;
                self.write_records(out, &[record])?;
            }
            Command::List {
                sort,
                desc,
                filter,
                page,
                size,
            } => {
                let direction = if *desc {
                    Direction::Descending
                } else {
                    Direction::Ascending
                };

                let records = match (filter, page) {
                    (None, None) => repository.find_all(sort, direction).await?,
                    (Some(query), None) => repository.find_where(query, sort, direction).await?,
                    (filter, Some(page_number)) => {
                        let page = match filter {
                            Some(query) => {
                                repository
                                    .find_page_where(query, *page_number, *size, sort, direction)
                                    .await?
                            }
                            None => {
                                repository
                                    .find_page(*page_number, *size, sort, direction)
                                    .await?
                            }
                        };
                        info!(
                            "Page {} of {} ({} record(s) in total)",
                            page.page_number + 1,
                            page.total_pages,
                            page.total_count
                        );
                        page.items
                    }
                };
                self.write_records(out, &records)?;
            }
            Command::Insert { json } => {
                let records = self.parse_records(json)?;
                let inserted = repository.insert_all(&records).await?;
                info!("Inserted {} record(s)", inserted.len());
                self.write_records(out, &inserted)?;
            }
            Command::Update { json } => {
                let records = self.parse_records(json)?;
                let updated = match records.as_slice() {
                    [record] => vec![repository.update(record).await?],
                    records => repository.update_all(records).await?,
                };
                info!("Updated {} record(s)", updated.len());
                self.write_records(out, &updated)?;
            }
            Command::Delete { ids } => {
                let keys = ids
                    .iter()
                    .map(|id| self.ctx.identity.parse(id))
                    .collect::<Result<Vec<_>, _>>()?;

                let deleted = match keys.as_slice() {
                    [key] => repository.delete(key).await?.into_iter().collect(),
                    keys => repository.delete_all(keys).await?,
                };
                info!("Deleted {} of {} record(s)", deleted.len(), keys.len());
                self.write_records(out, &deleted)?;
            }
        }

        Ok(())
    }

    /// Records from a JSON object or array, brought into wire shape.
    fn parse_records(&self, input: &str) -> Result<Vec<Record>, CliError> {
        let json: serde_json::Value =
            serde_json::from_str(input).map_err(|e| CliError::Json(e.to_string()))?;

        let objects = match json {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        };

        objects
            .into_iter()
            .map(|object| {
                let record = record_from_json(object).map_err(CliError::Json)?;
                Ok(self.ctx.fields.coerce_record(&record)?)
            })
            .collect()
    }

    fn write_records<W: Write>(&self, out: &mut W, records: &[Record]) -> Result<(), CliError> {
        for record in records {
            let line = json!({
                "id": self.ctx.identity.encode(record)?,
                "record": record_to_json(record),
            });
            writeln!(out, "{line}")?;
        }
        Ok(())
    }
}
