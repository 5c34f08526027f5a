//! The binary codefetch-sim.
//!
//! Puts one seeding node and a number of fetching nodes on a shared,
//! lossy, in-process radio and reports how long each fetch took. The
//! tokio clock is paused, so the reported times are protocol time and a
//! run finishes as fast as the cpu allows.

use codefetch_api::{config::Config, *};
use codefetch_core::{
    factories::{
        core_fetch::{config::CodeFetchModConfig, MOD_NAME},
        fn_table_relocator::{ENTRY_LEN, HEADER_LEN},
        FnTableRelocator, MemCodeStore, MemRadio, MemRegistry,
    },
    node::{FetchNode, NodeResources},
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

const KEY: ContentKey = ContentKey(1);
const REQUESTER: RequesterId = RequesterId(1);
const SEED_ADDR: NodeAddr = NodeAddr(1);

/// Functions in the module image built for `--relocatable`.
const NUM_FUNCS: u16 = 8;

/// Give up on a node after this much protocol time.
const GIVE_UP: Duration = Duration::from_secs(60 * 60);

#[derive(clap::Parser, Debug)]
#[command(version)]
pub struct Args {
    /// Number of nodes on the radio, including the one seeding the
    /// content. Every other node fetches it from the seed.
    #[arg(long, default_value_t = 5)]
    pub nodes: u16,

    /// Size of the content in bytes.
    #[arg(long, default_value_t = 4096)]
    pub size: u32,

    /// Chance that a frame is lost on its way to one listener.
    #[arg(long, default_value_t = 0.1)]
    pub loss: f64,

    /// Seed for the content and the loss model.
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Disseminate a relocatable module instead of raw bytes. Every node
    /// runs it at a different base address.
    #[arg(long)]
    pub relocatable: bool,

    /// Use code stores that complete reads and writes asynchronously.
    #[arg(long)]
    pub split_store: bool,

    /// Node configuration file in json, as written by `--print-config`.
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,

    /// Print the default node configuration and exit.
    #[arg(long)]
    pub print_config: bool,
}

fn main() {
    let args = <Args as clap::Parser>::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::WARN.into())
                .from_env_lossy(),
        )
        .init();

    if args.print_config {
        match default_config() {
            Ok(out) => println!("{out}"),
            Err(err) => fail(err),
        }
        return;
    }

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
    {
        Ok(rt) => rt,
        Err(err) => fail(FetchError::other_src("tokio runtime", err)),
    };

    if let Err(err) = rt.block_on(run(args)) {
        fail(err);
    }
}

fn fail(err: FetchError) -> ! {
    eprintln!("codefetch-sim: {err}");
    std::process::exit(1);
}

fn default_config() -> FetchResult<String> {
    let mut config = Config::default();
    config.add_default_module_config::<CodeFetchModConfig>(MOD_NAME.into())?;
    serde_json::to_string_pretty(&config)
        .map_err(|err| FetchError::other_src("encode config", err))
}

fn load_config(args: &Args) -> FetchResult<CodeFetchModConfig> {
    let config: Config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|err| {
                FetchError::other_src(format!("read {}", path.display()), err)
            })?;
            serde_json::from_str(&raw).map_err(|err| {
                FetchError::other_src(format!("parse {}", path.display()), err)
            })?
        }
        None => Config::default(),
    };
    config.get_module_config::<CodeFetchModConfig>(MOD_NAME)
}

/// What one node holds, and what it should end up holding.
struct SimNode {
    node: FetchNode,
    store: Arc<MemCodeStore>,
    handle: StoreHandle,
    expect: Vec<u8>,
}

fn base_for(addr: NodeAddr) -> CodeAddr {
    CodeAddr(0x1_0000 * *addr as u32)
}

/// The content as it lies in the store of the node at `addr`.
fn resident(image: &[u8], relocatable: bool, addr: NodeAddr) -> Vec<u8> {
    let mut out = image.to_vec();
    if relocatable {
        FnTableRelocator::create().patch_in(
            base_for(addr),
            NUM_FUNCS,
            &mut out,
            0,
        );
    }
    out
}

fn build_content(args: &Args) -> FetchResult<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let table = HEADER_LEN + NUM_FUNCS as usize * ENTRY_LEN;
    if !args.relocatable {
        let mut out = vec![0; args.size as usize];
        rng.fill(&mut out[..]);
        return Ok(out);
    }
    let Some(body_len) = (args.size as usize).checked_sub(table) else {
        return Err(FetchError::InvalidSize(args.size));
    };
    let mut body = vec![0; body_len];
    rng.fill(&mut body[..]);
    let funcs: Vec<u32> = (0..NUM_FUNCS as u32)
        .map(|n| (table + n as usize * 0x10) as u32)
        .collect();
    Ok(FnTableRelocator::build_image(3, table as u32, &funcs, &body))
}

fn spawn_node(
    radio: &Arc<MemRadio>,
    addr: NodeAddr,
    config: &CodeFetchModConfig,
    split_store: bool,
) -> (
    FetchNode,
    mpsc::Receiver<FetchDone>,
    Arc<MemRegistry>,
    Arc<MemCodeStore>,
) {
    let registry = MemRegistry::create();
    let (store, store_events) = if split_store {
        let (tx, rx) = mpsc::unbounded_channel();
        (MemCodeStore::create_split(tx), Some(rx))
    } else {
        (MemCodeStore::create(), None)
    };
    let (transport, frames) = radio.attach(addr);
    let (node, done) = FetchNode::spawn(
        config.code_fetch.clone(),
        NodeResources {
            registry: registry.clone(),
            store: store.clone(),
            relocator: FnTableRelocator::create(),
            transport,
            frames,
            store_events,
        },
        1,
    );
    (node, done, registry, store)
}

async fn run(args: Args) -> FetchResult<()> {
    if !(0.0..1.0).contains(&args.loss) {
        return Err(FetchError::other(format!(
            "loss must be in [0, 1), got {}",
            args.loss
        )));
    }
    if args.nodes < 2 {
        return Err(FetchError::other("need at least two nodes"));
    }

    let config = load_config(&args)?;
    let image = build_content(&args)?;
    let kind = if args.relocatable {
        ContentKind::RelocatableCode
    } else {
        ContentKind::Raw
    };

    let radio = MemRadio::create();
    let loss_rng = Mutex::new(StdRng::seed_from_u64(args.seed));
    let loss = args.loss;
    radio.set_drop_fn(move |_, _| loss_rng.lock().unwrap().gen_bool(loss));

    let (seed, _seed_done, seed_registry, seed_store) =
        spawn_node(&radio, SEED_ADDR, &config, args.split_store);
    let handle = seed_store.insert(
        resident(&image, args.relocatable, SEED_ADDR),
        base_for(SEED_ADDR),
    );
    seed_registry.insert(
        KEY,
        RegistryEntry {
            handle,
            status: FetchStatus::Done,
            kind,
        },
    );

    let start = Instant::now();
    let mut nodes = Vec::new();
    let mut waiting = tokio::task::JoinSet::new();
    for addr in 2..=args.nodes {
        let addr = NodeAddr(addr);
        let (node, mut done, registry, store) =
            spawn_node(&radio, addr, &config, args.split_store);
        let handle = store.alloc(args.size, base_for(addr));
        registry.insert(
            KEY,
            RegistryEntry {
                handle,
                status: FetchStatus::Queued,
                kind,
            },
        );
        node.request(REQUESTER, KEY, args.size, seed.addr()).await?;

        waiting.spawn(async move {
            let done = tokio::time::timeout(GIVE_UP, done.recv()).await;
            (addr, done.ok().flatten(), start.elapsed())
        });
        nodes.push(SimNode {
            node,
            store,
            handle,
            expect: resident(&image, args.relocatable, addr),
        });
    }

    let mut results = Vec::new();
    while let Some(r) = waiting.join_next().await {
        results.push(r.map_err(|err| FetchError::other_src("join", err))?);
    }
    results.sort_by_key(|(addr, _, _)| *addr);

    println!(
        "{} bytes ({} fragments) to {} nodes, loss {}",
        args.size,
        num_fragments_for(args.size),
        args.nodes - 1,
        args.loss,
    );
    let mut failed = 0;
    for (addr, done, elapsed) in results {
        let Some(sim) = nodes.iter().find(|n| n.node.addr() == addr) else {
            continue;
        };
        let outcome = done.map(|d| d.outcome);
        let intact = outcome == Some(FetchOutcome::Complete)
            && sim.store.contents(sim.handle).as_ref() == Some(&sim.expect);
        if !intact {
            failed += 1;
        }
        let outcome = match outcome {
            Some(outcome) => format!("{outcome:?}"),
            None => "no answer".to_string(),
        };
        println!(
            "node {addr}: {outcome} after {} ms, {}, sent {} frames",
            elapsed.as_millis(),
            if intact { "intact" } else { "NOT intact" },
            radio.frames_sent_by(addr),
        );
    }
    println!(
        "seed sent {} frames, {} frames in total",
        radio.frames_sent_by(seed.addr()),
        radio.frames_sent(),
    );

    if failed > 0 {
        return Err(FetchError::other(format!("{failed} nodes did not fetch")));
    }
    Ok(())
}
