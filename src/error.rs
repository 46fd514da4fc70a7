use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unauthorized"))]
    Unauthorized,

    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display("Internal server error"))]
    InternalServerError {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Missing header: {header}"))]
    MissingHeader { header: String },

    #[snafu(display("Invalid header: {header}"))]
    InvalidHeader { header: String },

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },

    #[snafu(display("Missing parameter: {message}"))]
    MissingParameter { message: String },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(eyre::Report, Some)))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::InternalServerError { source: Some(e) }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::InternalServerError {
            source: Some(e.into()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::InternalServerError {
            source: Some(e.into()),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn missing_parameter(message: impl Into<String>) -> Self {
        Self::MissingParameter {
            message: message.into(),
        }
    }

    pub fn webhook_not_found(id: i64, org: impl Into<String>) -> Self {
        Self::NotFound {
            resource: format!("webhook {} in org {}", id, org.into()),
        }
    }

    pub fn delivery_not_found(id: i64, org: impl Into<String>) -> Self {
        Self::NotFound {
            resource: format!("delivery {} in org {}", id, org.into()),
        }
    }
}

impl actix_web::ResponseError for Error {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            Self::Unauthorized => actix_web::http::StatusCode::UNAUTHORIZED,
            Self::NotFound { .. } => actix_web::http::StatusCode::NOT_FOUND,

            Self::MissingHeader { .. }
            | Self::MissingParameter { .. }
            | Self::InvalidHeader { .. }
            | Self::InvalidParameter { .. } => actix_web::http::StatusCode::BAD_REQUEST,

            Self::MigrationError { .. }
            | Self::InternalServerError { .. }
            | Self::Sqlx { .. }
            | Self::Whatever { .. } => actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
