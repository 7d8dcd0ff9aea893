use clap::{crate_version, Parser};

use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use voluntlib::certificate::{CertificateAuthority, Ed25519CertificateService, Identity};
use voluntlib::computation::ComputationQueue;
use voluntlib::config::ManagementConfig;
use voluntlib::job::{Job, JobId};
use voluntlib::manager::JobManager;
use voluntlib::network::MemoryNetwork;
use voluntlib::repository::{FileJobRepository, HashMapJobRepository, JobRepository};

const AUTHORITY_SECRET_FILE: &str = "authority.key";

#[derive(Debug, Parser)]
#[command(name = "voluntlib")]
#[command(version = crate_version!())]
#[command(
    about = "VoluntLib - management layer of a peer-to-peer volunteer computing network",
    long_about = "VoluntLib peers publish signed jobs, replicate the jobs of other peers, fetch missing payloads, track calculated blocks epoch by epoch and propagate deletions. This tool sets up a peer's configuration and identity, inspects the jobs a peer has persisted, and runs an in-memory simulation of two peers."
)]
enum CliArgument {
    /// Create the configuration directory, a certificate authority and a certified identity.
    Init {
        /// Subject name of the new identity.
        #[clap(long, short)]
        name: String,

        /// Hex file with the secret key of an existing authority; a new authority is
        /// generated when omitted.
        #[clap(long, short)]
        authority_key: Option<PathBuf>,
    },
    /// List the jobs persisted by a peer and whether their signatures verify.
    List {
        /// Print JSON instead of a table.
        #[clap(long, short)]
        json: bool,
    },
    /// Decode a single `.job` file.
    Inspect {
        /// Path of the job file.
        file: PathBuf,

        /// Print JSON instead of text.
        #[clap(long, short)]
        json: bool,
    },
    /// Run two in-memory peers through create, propagate, delete and housekeeping.
    Simulate {
        /// Number of blocks of the simulated job.
        #[clap(long, short, default_value_t = 1000)]
        blocks: u128,
    },
}

#[derive(Parser, Debug)]
#[clap(name = "VoluntLib Management Layer")]
struct Opt {
    /// Configuration directory.
    #[clap(long, short, default_value = ".voluntlib")]
    config: PathBuf,

    /// Subcommand to run.
    #[clap(subcommand)]
    argument: CliArgument,
}

fn certificates(config: &ManagementConfig) -> Result<Ed25519CertificateService, Box<dyn Error>> {
    if !config.has_identity() {
        return Err(format!("no identity in {:?}, run `voluntlib init` first", config.config_path).into());
    }
    Ok(Ed25519CertificateService::new(config.identity()?, config.authority_key()?).with_admins(config.admins.clone()))
}

fn job_json(job: &Job, valid_signature: Option<bool>) -> serde_json::Value {
    serde_json::json!({
        "id": job.id().to_string(),
        "name": job.name(),
        "type": job.job_type(),
        "description": job.description(),
        "world": job.world_name(),
        "creator": job.creator_name(),
        "created": job.creation_date().to_rfc3339(),
        "blocks": job.number_of_blocks().to_string(),
        "calculated_blocks": job.number_of_calculated_blocks().to_string(),
        "payload_size": job.payload().len(),
        "deletion_signature": !job.deletion_signature().is_empty(),
        "valid_signature": valid_signature,
    })
}

fn init(config: &ManagementConfig, name: &str, authority_key: Option<PathBuf>) -> Result<(), Box<dyn Error>> {
    let authority = match authority_key {
        Some(path) => {
            let secret: [u8; 32] = hex::decode(fs::read_to_string(path)?.trim())?
                .try_into()
                .map_err(|_| "authority key must be 32 bytes")?;
            CertificateAuthority::from_bytes(&secret)
        }
        None => {
            let authority = CertificateAuthority::generate();
            let path = config.config_path.join(AUTHORITY_SECRET_FILE);
            fs::write(&path, hex::encode(authority.to_bytes()))?;
            println!("🔑 new authority key written to {path:?}");
            authority
        }
    };
    let identity = Identity::generate(name, &authority)?;
    config.store_identity(&identity, &authority.verifying_key())?;
    println!("🪪 identity {name:?} stored in {:?}", config.config_path);
    Ok(())
}

fn list(config: &ManagementConfig, json: bool) -> Result<(), Box<dyn Error>> {
    let certificates = certificates(config)?;
    let repository = FileJobRepository::new(config.storage_path.clone());
    let mut jobs = Vec::new();
    for stored in repository.load_all().map_err(|err| err as Box<dyn Error>)? {
        match Job::deserialize(&stored.bytes) {
            Ok(mut job) => {
                let valid = job.has_valid_creator_signature(&certificates);
                job.refresh_deletion_state(&certificates);
                jobs.push((job, valid));
            }
            Err(err) => warn!(key = %stored.key, %err, "skipping corrupt job file"),
        }
    }
    jobs.sort_by(|a, b| b.0.creation_date().cmp(&a.0.creation_date()));

    if json {
        let values: Vec<_> = jobs.iter().map(|(job, valid)| job_json(job, Some(*valid))).collect();
        println!("{}", serde_json::to_string_pretty(&values)?);
        return Ok(());
    }
    println!("{:<34} {:<20} {:<12} {:>12} {:>12} {:<8}", "ID", "NAME", "CREATOR", "BLOCKS", "DONE", "STATE");
    for (job, valid) in &jobs {
        let state = match (valid, job.is_deleted()) {
            (false, _) => "invalid",
            (true, true) => "deleted",
            (true, false) => "live",
        };
        println!(
            "{:<34} {:<20} {:<12} {:>12} {:>12} {:<8}",
            job.id().to_string(),
            job.name(),
            job.creator_name(),
            job.number_of_blocks(),
            job.number_of_calculated_blocks(),
            state
        );
    }
    Ok(())
}

fn inspect(file: PathBuf, json: bool) -> Result<(), Box<dyn Error>> {
    let job = Job::deserialize(&fs::read(file)?)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&job_json(&job, None))?);
    } else {
        println!("{job}");
    }
    Ok(())
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) -> Result<(), Box<dyn Error>> {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        if Instant::now() > deadline {
            return Err(format!("timed out waiting until {what}").into());
        }
        sleep(Duration::from_millis(20)).await;
    }
    debug!("{what}");
    Ok(())
}

async fn simulate(blocks: u128) -> Result<(), Box<dyn Error>> {
    let authority = CertificateAuthority::generate();
    let network = MemoryNetwork::new();
    let config = ManagementConfig {
        share_interval_ms: 200,
        request_job_list_interval_ms: 200,
        payload_request_interval_ms: 200,
        housekeeping_interval_ms: 500,
        deletion_grace_period_secs: 0,
        worker_sleep_ms: 1,
        ..ManagementConfig::default()
    };
    let peer = |name: &str| -> Result<(JobManager, Arc<ComputationQueue>), Box<dyn Error>> {
        let certificates = Ed25519CertificateService::new(Identity::generate(name, &authority)?, authority.verifying_key());
        let computation = Arc::new(ComputationQueue::new());
        let manager = JobManager::new(
            config.clone(),
            Arc::new(certificates),
            Arc::new(network.connect()),
            computation.clone(),
            Arc::new(HashMapJobRepository::new()),
        );
        Ok((manager, computation))
    };
    let (alice, _) = peer("alice")?;
    let (bob, bob_computation) = peer("bob")?;
    alice.start()?;
    bob.start()?;

    let job_id: JobId = alice
        .create_job("simulation", "demo", "Demo job", "simulated job", b"payload".to_vec(), blocks)
        .await?;
    println!("✨ alice created job {job_id} with {blocks} blocks");

    wait_until("bob received the job with its payload", || {
        bob.get_job_by_id(job_id).map(|job| job.has_payload()).unwrap_or(false)
    })
    .await?;
    println!("📥 bob received job {job_id}");

    if let Some(mut state) = alice.state_of_job(job_id) {
        if let Some(bit) = state.bitmask.get_random_free_bit() {
            state.bitmask.set_bit(bit)?;
            if let Some(mut job) = alice.context().jobs.get_mut(&job_id) {
                job.merge_epoch_state(&state, alice.context().config.max_bitmask_size)?;
            }
        }
    }
    wait_until("bob merged alice's results", || {
        bob_computation.run_pending();
        bob.calculated_blocks_of_job(job_id) == 1
    })
    .await?;
    println!("🧮 bob sees {} calculated block(s)", bob.calculated_blocks_of_job(job_id));

    alice.delete_job(job_id).await?;
    println!("🗑️ alice deleted job {job_id}");
    wait_until("bob saw the deletion", || {
        bob.get_job_by_id(job_id).map(|job| job.is_deleted()).unwrap_or(true)
    })
    .await?;
    alice.stop().await;
    wait_until("bob removed the job", || bob.get_job_by_id(job_id).is_none()).await?;
    println!("🧹 bob removed deleted job {job_id}");
    bob.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let opt = Opt::parse();

    match opt.argument {
        CliArgument::Init { name, authority_key } => {
            let config = ManagementConfig::load(&opt.config)?;
            init(&config, &name, authority_key)
        }
        CliArgument::List { json } => {
            let config = ManagementConfig::load(&opt.config)?;
            list(&config, json)
        }
        CliArgument::Inspect { file, json } => inspect(file, json),
        CliArgument::Simulate { blocks } => simulate(blocks).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voluntlib::certificate::CertificateService;

    #[test]
    fn test_list_reads_stored_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let config = ManagementConfig::load(dir.path()).unwrap();
        init(&config, "alice", None).unwrap();
        let certificates = certificates(&config).unwrap();

        let mut job = Job::new(JobId::random())
            .with_name("primes")
            .with_creator_name(certificates.own_name())
            .with_number_of_blocks(16)
            .with_creator_certificate(certificates.own_certificate());
        job.generate_creator_signature(&certificates).unwrap();
        let repository = FileJobRepository::new(config.storage_path.clone());
        repository.save(&job.id().file_name(), &job.serialize().unwrap()).unwrap();
        repository.save("broken.job", b"garbage").unwrap();

        assert!(list(&config, true).is_ok());
        assert!(list(&config, false).is_ok());
    }
}
