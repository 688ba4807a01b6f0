#[macro_use]
extern crate rocket;
#[macro_use]
extern crate serde;
#[macro_use]
extern crate serde_json;
#[macro_use]
extern crate log;
#[macro_use]
extern crate diesel;
#[macro_use]
extern crate diesel_migrations;

use std::{fs::create_dir_all, process::exit, thread, time::Duration};

#[macro_use]
mod error;

mod api;
mod auth;
mod broker;
mod config;
mod crypto;
mod db;
mod sso;
mod util;

#[cfg(all(test, sqlite))]
mod tests;

pub use config::CONFIG;
pub use error::{Error, MapResult};

use crate::db::{
    models::{AuthCode, HandoffCode, Session},
    DbPool,
};

pub const VERSION: Option<&str> = option_env!("GW_VERSION");

#[rocket::main]
async fn main() -> Result<(), Error> {
    parse_args();
    launch_info();

    init_logging()?;
    check_data_folder();

    if let Err(e) = auth::initialize_keys() {
        error!("Error creating or loading the RSA keys: {e:#?}");
        exit(1);
    }

    let pool = create_db_pool();
    sync_sso_domains(&pool).await;
    schedule_jobs(pool.clone());

    launch_rocket(pool).await
}

const HELP: &str = "\
Authentication and session service

USAGE:
    gatewarden

FLAGS:
    -h, --help       Prints help information
    -v, --version    Prints the app version
";

pub fn gatewarden_version() -> String {
    format!("gatewarden {}", VERSION.unwrap_or("(unknown version)"))
}

fn parse_args() {
    let mut pargs = pico_args::Arguments::from_env();

    if pargs.contains(["-h", "--help"]) {
        println!("{}", gatewarden_version());
        print!("{HELP}");
        exit(0);
    } else if pargs.contains(["-v", "--version"]) {
        println!("{}", gatewarden_version());
        exit(0);
    }
}

fn launch_info() {
    println!("/--------------------------------------------------------------------\\");
    println!("|                        Starting Gatewarden                         |");
    if let Some(version) = VERSION {
        println!("|{:^68}|", format!("Version {version}"));
    }
    println!("\\--------------------------------------------------------------------/\n");
}

fn init_logging() -> Result<(), Error> {
    let level = match CONFIG.log_level().to_lowercase().parse::<log::LevelFilter>() {
        Ok(level) => level,
        Err(_) => {
            let valid = "off, error, warn, info, debug or trace";
            return Err(Error::new("Invalid LOG_LEVEL", format!("LOG_LEVEL must be one of: {valid}")));
        }
    };

    let mut logger = fern::Dispatch::new()
        .level(level)
        // Hide failed to close stream messages and other connection noise
        .level_for("hyper::proto", log::LevelFilter::Off)
        .level_for("hyper::client", log::LevelFilter::Off)
        .level_for("rustls", log::LevelFilter::Warn)
        .level_for("rocket::response::responder", log::LevelFilter::Warn)
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format(&CONFIG.log_timestamp_format()),
                record.target(),
                record.level(),
                message
            ))
        })
        .chain(std::io::stderr());

    if !CONFIG.extended_logging() {
        logger = logger.level_for("gatewarden::api", log::LevelFilter::Warn);
    }

    if let Some(log_file) = CONFIG.log_file() {
        logger = logger.chain(fern::log_file(log_file)?);
    }

    #[cfg(unix)]
    if CONFIG.use_syslog() {
        logger = chain_syslog(logger);
    }

    logger.apply().map_err(|e| Error::new("Failed to initialize the logger", e.to_string()))?;
    Ok(())
}

#[cfg(unix)]
fn chain_syslog(logger: fern::Dispatch) -> fern::Dispatch {
    let syslog_fmt = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_USER,
        hostname: None,
        process: "gatewarden".into(),
        pid: 0,
    };

    match syslog::unix(syslog_fmt) {
        Ok(sl) => logger.chain(sl),
        Err(e) => {
            error!("Unable to connect to syslog: {e:?}");
            logger
        }
    }
}

fn check_data_folder() {
    let data_folder = CONFIG.data_folder();
    if let Err(e) = create_dir_all(&data_folder) {
        error!("Cannot create data folder '{data_folder}': {e:?}");
        exit(1);
    }
}

fn create_db_pool() -> DbPool {
    match util::retry(DbPool::from_config, 3) {
        Ok(pool) => pool,
        Err(e) => {
            error!("Error creating the database pool: {e:#?}");
            exit(2);
        }
    }
}

async fn sync_sso_domains(pool: &DbPool) {
    let conn = match pool.get().await {
        Ok(conn) => conn,
        Err(e) => {
            error!("Error getting a connection for the SSO domain sync: {e:#?}");
            exit(2);
        }
    };
    if let Err(e) = sso::sync_domain_mappings(&conn).await {
        error!("Error syncing the SSO_DOMAINS mappings: {e:#?}");
        exit(1);
    }
}

fn schedule_jobs(pool: DbPool) {
    if CONFIG.job_poll_interval_ms() == 0 {
        info!("Job scheduler disabled.");
        return;
    }

    let runtime = tokio::runtime::Runtime::new().unwrap();

    thread::Builder::new()
        .name("job-scheduler".to_string())
        .spawn(move || {
            use job_scheduler_ng::{Job, JobScheduler};
            let _runtime_guard = runtime.enter();

            let mut sched = JobScheduler::new();

            // Revoke run-out sessions and drop the ones that are both expired
            // and revoked.
            sched.add(Job::new(CONFIG.purge_sessions_schedule().parse().unwrap(), || {
                runtime.spawn(purge_sessions(pool.clone()));
            }));

            sched.add(Job::new(CONFIG.purge_auth_codes_schedule().parse().unwrap(), || {
                runtime.spawn(purge_auth_codes(pool.clone()));
            }));

            sched.add(Job::new(CONFIG.purge_handoff_codes_schedule().parse().unwrap(), || {
                runtime.spawn(purge_handoff_codes(pool.clone()));
            }));

            loop {
                sched.tick();
                runtime.block_on(tokio::time::sleep(Duration::from_millis(CONFIG.job_poll_interval_ms())));
            }
        })
        .expect("Error spawning job scheduler thread");
}

async fn purge_sessions(pool: DbPool) {
    if let Err(e) = Session::purge_expired(pool).await {
        error!("Error purging sessions: {e:#?}");
    }
}

async fn purge_auth_codes(pool: DbPool) {
    if let Err(e) = AuthCode::purge_expired(pool).await {
        error!("Error purging authorization codes: {e:#?}");
    }
}

async fn purge_handoff_codes(pool: DbPool) {
    if let Err(e) = HandoffCode::purge_expired(pool).await {
        error!("Error purging handoff codes: {e:#?}");
    }
}

pub fn build_rocket(pool: DbPool, broker_client: Box<dyn broker::IdentityBroker>) -> rocket::Rocket<rocket::Build> {
    rocket::custom(rocket::Config::figment())
        .mount("/oauth", api::oauth_routes())
        .mount("/", api::magic_routes())
        .mount("/", api::handoff_routes())
        .mount("/", api::sessions_routes())
        .mount("/", api::webhooks_routes())
        .mount("/", api::web_routes())
        .register("/", api::catchers())
        .manage(pool)
        .manage(broker_client)
        .attach(util::AppHeaders())
        .attach(util::Cors())
}

async fn launch_rocket(pool: DbPool) -> Result<(), Error> {
    let broker_client: Box<dyn broker::IdentityBroker> = Box::new(broker::HttpBroker::from_config()?);

    let _rocket = build_rocket(pool, broker_client).launch().await?;

    info!("Gatewarden process exited!");
    Ok(())
}
