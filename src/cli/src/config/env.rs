#[derive(Default, Debug, Clone)]
pub(crate) struct Values {
  pub(crate) persistence_target: Option<String>,
  pub(crate) csv_dir: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
  #[error("Failed reading env var {0}")]
  EnvVarRead(String, #[source] std::env::VarError),
}

pub(crate) fn parse() -> Result<Values, ParseError> {
  let _ = dotenv::dotenv();

  let values = Values {
    persistence_target: optional("SCADAPOLL_PERSISTENCE_TARGET")?,
    csv_dir: optional("SCADAPOLL_CSV_DIR")?,
  };

  Ok(values)
}

fn optional(name: &str) -> Result<Option<String>, ParseError> {
  match std::env::var(name) {
    Ok(value) if value.is_empty() => Ok(None),
    Ok(value) => Ok(Some(value)),
    Err(std::env::VarError::NotPresent) => Ok(None),
    Err(error) => Err(ParseError::EnvVarRead(name.to_owned(), error)),
  }
}
