mod cli;

use std::{fs, process::ExitCode};

use clap::Parser;
use cli::{Cli, Command, SchemaArgs};
use relmap_engine::{
    load_schemas, metadata::layer_category, AnalyzerError, Conf, ConfError, MemoryStore,
    ReadError, Reader, SchemaAnalyzer, SchemaModel, StorageError, WriteError, Writer,
    XmlEventSource,
};
use relmap_xsd::{SchemaSource, XsdError};
use serde_json::{json, Value as Json};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Conf(#[from] ConfError),
    #[error(transparent)]
    Schema(#[from] XsdError),
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("no schema given and {0} names none")]
    NoSchema(String),
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let mut conf = match &cli.conf {
        Some(path) => Conf::load(path)?,
        None => Conf::default(),
    };
    match cli.command {
        Command::Analyze { schemas, output } => {
            let sources = parse_sources(&schemas.xsd);
            if sources.is_empty() {
                return Err(CliError::NoSchema("the command line".into()));
            }
            let (model, warnings) = analyze(&mut conf, &schemas, &sources)?;
            let text = serde_json::to_string_pretty(&describe(&model, &warnings))?;
            match output {
                Some(path) => fs::write(path, text)?,
                None => println!("{text}"),
            }
        }
        Command::Read {
            input,
            output,
            schemas,
            validate,
            fail_if_error,
            remove_unused,
        } => {
            conf.validation.enabled |= validate;
            conf.validation.fail_if_error |= fail_if_error;
            if remove_unused {
                conf.layer_building.remove_unused_layers = true;
                conf.layer_building.remove_unused_fields = true;
            }
            let mut source = XmlEventSource::from_file(&input);
            let mut sources = parse_sources(&schemas.xsd);
            if sources.is_empty() {
                sources = source.schema_locations()?;
            }
            if sources.is_empty() {
                return Err(CliError::NoSchema(input.display().to_string()));
            }
            let (model, _) = analyze(&mut conf, &schemas, &sources)?;

            let mut store = MemoryStore::new();
            let mut reported = 0.0;
            let outcome = Reader::new(model, &conf)
                .with_progress(|fraction| {
                    if fraction - reported >= 0.1 {
                        reported = fraction;
                        info!("{:.0}%", fraction * 100.0);
                    }
                    true
                })
                .read(&mut source, &mut store)?;
            let report = outcome.report();
            for message in &report.validation_errors {
                warn!("{message}");
            }
            for (layer, count) in &report.rows {
                info!("{layer}: {count} rows");
            }
            store.save(&output)?;
            info!("Saved tables to {}", output.display());
        }
        Command::Write {
            input,
            output,
            indentation,
            wrapping,
            line_format,
            comment,
        } => {
            if let Some(size) = indentation {
                conf.writer.indentation_size = size.min(8);
            }
            if let Some(wrapping) = wrapping {
                conf.writer.wrapping = wrapping.into();
            }
            if let Some(line_format) = line_format {
                conf.writer.line_format = line_format.into();
            }
            if comment.is_some() {
                conf.writer.comment = comment;
            }
            let store = MemoryStore::load(&input)?;
            let count = Writer::new(&conf).write_file(&store, &output)?;
            info!("Wrote {count} members to {}", output.display());
        }
    }
    Ok(())
}

/// Parses `location` or `namespace=location` schema arguments.
fn parse_sources(arguments: &[String]) -> Vec<SchemaSource> {
    arguments
        .iter()
        .map(|argument| match argument.split_once('=') {
            Some((namespace, location)) => SchemaSource {
                namespace: Some(namespace.to_string()),
                location: location.to_string(),
            },
            None => SchemaSource {
                namespace: None,
                location: argument.clone(),
            },
        })
        .collect()
}

fn analyze(
    conf: &mut Conf,
    schemas: &SchemaArgs,
    sources: &[SchemaSource],
) -> Result<(SchemaModel, Vec<String>), CliError> {
    if schemas.offline {
        conf.allow_remote_schema_download = false;
    }
    let set = load_schemas(conf, sources)?;
    let (model, warnings) = SchemaAnalyzer::new(conf).analyze(&set)?;
    for warning in &warnings {
        warn!("{warning}");
    }
    info!("{} layers", model.len());
    Ok((model, warnings))
}

fn describe(model: &SchemaModel, warnings: &[String]) -> Json {
    let layers = model
        .classes()
        .into_iter()
        .map(|id| {
            let class = model.class(id);
            let fields = class
                .fields
                .iter()
                .map(|field| {
                    json!({
                        "name": field.name,
                        "xpath": field.xpath,
                        "type": field.field_type.as_str(),
                        "category": field.category.as_str(),
                        "nullable": !field.not_nullable,
                        "array": field.is_array,
                        "related_layer": field.related_class_xpath,
                        "junction_layer": field.junction_layer,
                    })
                })
                .collect::<Vec<_>>();
            json!({
                "name": class.name,
                "xpath": class.xpath,
                "category": layer_category(class),
                "fields": fields,
            })
        })
        .collect::<Vec<_>>();
    json!({ "layers": layers, "warnings": warnings })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_arguments() {
        let sources = parse_sources(&[
            "urn:t=schemas/t.xsd".into(),
            "http://example.invalid/a=b.xsd".into(),
            "plain.xsd".into(),
        ]);
        assert_eq!(sources[0].namespace.as_deref(), Some("urn:t"));
        assert_eq!(sources[0].location, "schemas/t.xsd");
        assert_eq!(sources[1].namespace.as_deref(), Some("http://example.invalid/a"));
        assert_eq!(sources[2].namespace, None);
        assert_eq!(sources[2].location, "plain.xsd");
    }
}
