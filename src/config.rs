use std::process::exit;
use std::str::FromStr;

use job_scheduler_ng::Schedule;
use once_cell::sync::Lazy;
use url::Url;

use crate::{
    db::DbConnType,
    error::Error,
    util::{get_env, get_env_bool, parse_csv},
};

pub static CONFIG: Lazy<Config> = Lazy::new(|| {
    Config::load().unwrap_or_else(|e| {
        println!("Error loading config:\n  {e:?}\n");
        exit(12)
    })
});

pub type Pass = String;

macro_rules! make_config {
    ($(
        $group:ident {
        $(
            $(#[doc = $doc:literal])+
            $name:ident : $ty:ident, $none_action:ident $(, $default:expr)?;
        )+},
    )+) => {
        pub struct Config {
            config: ConfigItems,
        }

        #[derive(Clone, Default)]
        struct ConfigBuilder {
            $($(
                $name: Option<$ty>,
            )+)+
        }

        impl ConfigBuilder {
            #[allow(clippy::field_reassign_with_default)]
            fn from_env() -> Self {
                let env_file = get_env("ENV_FILE").unwrap_or_else(|| String::from(".env"));
                match dotenvy::from_path(&env_file) {
                    Ok(_) => {
                        println!("[INFO] Using environment file `{env_file}` for configuration.\n");
                    }
                    Err(e) => match e {
                        dotenvy::Error::LineParse(msg, pos) => {
                            println!("[ERROR] Failed parsing environment file: `{env_file}`\nNear {msg:?} on position {pos}\nPlease fix and restart!\n");
                            exit(255);
                        }
                        dotenvy::Error::Io(ioerr) if ioerr.kind() == std::io::ErrorKind::NotFound => {
                            // Only exit if this environment variable is set, but the file was not found.
                            // This prevents incorrectly configured environments.
                            if let Some(env_file) = get_env::<String>("ENV_FILE") {
                                println!("[ERROR] The configured ENV_FILE `{env_file}` was not found!\n");
                                exit(255);
                            }
                        }
                        _ => {
                            println!("[ERROR] Reading environment file `{env_file}` failed:\n{e:?}\n");
                            exit(255);
                        }
                    }
                };

                let mut builder = ConfigBuilder::default();
                $($(
                    builder.$name = make_config! { @getenv pastey::paste!(stringify!([<$name:upper>])), $ty };
                )+)+

                builder
            }

            fn build(&self) -> ConfigItems {
                let mut config = ConfigItems::default();
                $($(
                    config.$name = make_config!{ @build self.$name.clone(), &config, $none_action, $($default)? };
                )+)+

                config
            }
        }

        #[derive(Clone, Default)]
        struct ConfigItems { $($( $name: make_config!{@type $ty, $none_action}, )+)+ }

        #[allow(unused)]
        impl Config {
            $($(
                $(#[doc = $doc])+
                pub fn $name(&self) -> make_config!{@type $ty, $none_action} {
                    self.config.$name.clone()
                }
            )+)+
        }
    };

    // Wrap the optionals in an Option type
    ( @type $ty:ty, option) => { Option<$ty> };
    ( @type $ty:ty, $id:ident) => { $ty };

    // Generate the values depending on none_action
    ( @build $value:expr, $config:expr, option, ) => { $value };
    ( @build $value:expr, $config:expr, def, $default:expr ) => {
        match $value {
            Some(v) => v,
            None => $default,
        }
    };
    ( @build $value:expr, $config:expr, auto, $default_fn:expr ) => {
        match $value {
            Some(v) => v,
            None => {
                let f: &dyn Fn(&ConfigItems) -> _ = &$default_fn;
                f($config)
            }
        }
    };

    ( @getenv $name:expr, bool ) => { get_env_bool($name) };
    ( @getenv $name:expr, $ty:ident ) => { get_env($name) };
}

make_config! {
    folders {
        /// Main data folder
        data_folder:            String, def,  "data".to_string();
        /// Session signing keypair
        rsa_key_filename:       String, auto, |c| format!("{}/{}", c.data_folder, "rsa_key");
    },
    database {
        /// Database URL
        database_url:           String, auto, |c| format!("{}/{}", c.data_folder, "gatewarden.sqlite3");
        /// Max database connection pool size
        database_max_conns:     u32,    def,  10;
        /// Min idle database connections
        database_min_conns:     u32,    def,  2;
        /// Seconds to wait for a database connection (doubles as the query time limit)
        database_timeout:       u64,    def,  2;
        /// Seconds before an idle connection is closed
        database_idle_timeout:  u64,    def,  600;
        /// Connection init statements, executed on checkout
        database_conn_init:     String, def,  String::new();
    },
    settings {
        /// Public origin this service is reachable at
        domain:                 String, def,  "http://localhost:8000".to_string();
        /// Origin of the web dashboard (CORS origin and handoff login target)
        web_app_url:            String, auto, |c| c.domain.clone();
        /// Client IP header, set by a reverse proxy
        ip_header:              String, def,  "X-Real-IP".to_string();
    },
    oauth {
        /// Client id of the web dashboard
        web_client_id:          String, def,  "app-web".to_string();
        /// Comma-separated native client ids; these require PKCE on every code grant
        native_client_ids:      String, def,  "app-desktop,app-xr,app-mobile".to_string();
        /// Comma-separated explicitly allowed web redirect URIs
        web_redirect_uris:      String, def,  String::new();
        /// Comma-separated custom URI schemes accepted for native redirects
        custom_uri_schemes:     String, def,  "app".to_string();
        /// Social provider used when nothing else is selected (google, microsoft or apple)
        default_provider:       String, option;
        /// Access token lifetime in seconds
        access_token_ttl:       i64,    def,  600;
        /// Refresh token (session) lifetime in seconds, absolute
        refresh_token_ttl:      i64,    def,  2_592_000;
        /// Authorization code lifetime in seconds
        auth_code_ttl:          i64,    def,  600;
        /// Handoff code lifetime in seconds
        handoff_code_ttl:       i64,    def,  300;
    },
    sso {
        /// JSON array of `{domain, connection, protocol?, email_pattern?}` objects synced into the SSO domain table at startup
        sso_domains:            String, def,  String::new();
    },
    broker {
        /// Base URL of the identity-broker API
        broker_api_base:        String, def,  "http://localhost:9000".to_string();
        /// API key for the identity broker
        broker_api_key:         Pass,   def,  String::new();
        /// Client id registered at the identity broker
        broker_client_id:       String, def,  String::new();
        /// Secret for identity-broker webhook signatures
        broker_webhook_secret:  Pass,   def,  String::new();
        /// Timeout in seconds for identity-broker calls
        broker_timeout:         u64,    def,  10;
    },
    secrets {
        /// HMAC secret for refresh tokens and signed state blobs
        token_hmac_secret:      Pass,   auto, |_| crate::crypto::generate_secret();
        /// Pepper mixed into stored refresh-token hashes
        refresh_token_pepper:   Pass,   auto, |_| crate::crypto::generate_secret();
    },
    jobs {
        /// Scheduler poll interval in milliseconds
        job_poll_interval_ms:   u64,    def,  30_000;
        /// Cron schedule for purging expired revoked sessions
        purge_sessions_schedule:       String, def, "0 10 0 * * *".to_string();
        /// Cron schedule for purging expired authorization codes
        purge_auth_codes_schedule:     String, def, "0 30 * * * *".to_string();
        /// Cron schedule for purging expired handoff codes
        purge_handoff_codes_schedule:  String, def, "0 15 * * * *".to_string();
    },
    log {
        /// Log level
        log_level:              String, def,  "info".to_string();
        /// Log file path
        log_file:               String, option;
        /// Log to syslog instead of stderr
        use_syslog:             bool,   def,  false;
        /// Log successful authentications and rotations, not only failures
        extended_logging:       bool,   def,  true;
        /// Timestamp format of log lines
        log_timestamp_format:   String, def,  "%Y-%m-%d %H:%M:%S.%3f".to_string();
    },
}

fn validate_config(cfg: &ConfigItems) -> Result<(), Error> {
    // Fails early when the URL scheme does not match the enabled backends.
    DbConnType::from_url(&cfg.database_url)?;

    let url_fields = [("DOMAIN", &cfg.domain), ("WEB_APP_URL", &cfg.web_app_url), ("BROKER_API_BASE", &cfg.broker_api_base)];
    for (name, value) in url_fields {
        if Url::parse(value).is_err() {
            err_silent!(format!("`{name}={value}` is not a valid URL"));
        }
    }

    for uri in parse_csv(&cfg.web_redirect_uris) {
        if Url::parse(&uri).is_err() {
            err_silent!(format!("`WEB_REDIRECT_URIS` entry `{uri}` is not a valid URL"));
        }
    }

    let schedules = [
        ("PURGE_SESSIONS_SCHEDULE", &cfg.purge_sessions_schedule),
        ("PURGE_AUTH_CODES_SCHEDULE", &cfg.purge_auth_codes_schedule),
        ("PURGE_HANDOFF_CODES_SCHEDULE", &cfg.purge_handoff_codes_schedule),
    ];
    for (name, value) in schedules {
        if Schedule::from_str(value).is_err() {
            err_silent!(format!("`{name}={value}` is not a valid cron expression"));
        }
    }

    if let Some(provider) = &cfg.default_provider {
        if !matches!(provider.as_str(), "google" | "microsoft" | "apple") {
            err_silent!(format!("`DEFAULT_PROVIDER={provider}` is not one of google, microsoft or apple"));
        }
    }

    if cfg.token_hmac_secret.len() < 32 {
        err_silent!("`TOKEN_HMAC_SECRET` needs to be at least 32 characters long");
    }

    Ok(())
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        // Loading from env only, the sources are env -> defaults
        let _env = ConfigBuilder::from_env();
        let config = _env.build();

        if get_env::<String>("TOKEN_HMAC_SECRET").is_none() {
            println!("[WARNING] TOKEN_HMAC_SECRET is not set, using an ephemeral secret.");
            println!("[WARNING] Refresh tokens and pending logins will not survive a restart.\n");
        }
        if config.broker_webhook_secret.is_empty() {
            println!("[WARNING] BROKER_WEBHOOK_SECRET is not set, identity webhooks will be rejected.\n");
        }

        validate_config(&config)?;

        Ok(Config {
            config,
        })
    }

    /// The ascii origin (scheme://host[:port]) of this service.
    pub fn domain_origin(&self) -> String {
        Url::parse(&self.domain()).map(|u| u.origin().ascii_serialization()).unwrap_or_default()
    }

    pub fn web_app_origin(&self) -> String {
        Url::parse(&self.web_app_url()).map(|u| u.origin().ascii_serialization()).unwrap_or_default()
    }

    pub fn private_rsa_key(&self) -> String {
        format!("{}.pem", self.rsa_key_filename())
    }

    pub fn public_rsa_key(&self) -> String {
        format!("{}.pub.pem", self.rsa_key_filename())
    }

    pub fn web_redirect_uris_vec(&self) -> Vec<String> {
        parse_csv(&self.web_redirect_uris())
    }

    pub fn native_client_ids_vec(&self) -> Vec<String> {
        parse_csv(&self.native_client_ids())
    }

    pub fn custom_uri_schemes_vec(&self) -> Vec<String> {
        parse_csv(&self.custom_uri_schemes())
    }

    /// Native clients complete the code grant without a client secret, so they
    /// must carry a PKCE challenge instead.
    pub fn is_native_client(&self, client_id: &str) -> bool {
        self.native_client_ids_vec().iter().any(|id| id == client_id)
    }

    pub fn is_allowed_client(&self, client_id: &str) -> bool {
        client_id == self.web_client_id() || self.is_native_client(client_id)
    }
}
