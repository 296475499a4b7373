use clap::{Parser, ValueEnum};
use phylodist::io::{read_newick_trees, write_table_tsv};
use phylodist::reconcile::{DISTANCE_NAMES, GeneTree, SpeciesTree};
use phylodist::topology::{Topology, TreeShape};
use std::path::PathBuf;
use std::time::Instant;

/// Score a collection of gene trees against a species tree and write a
/// labelled table (TSV) of reconciliation and split distances, one row per
/// gene tree.
#[derive(Parser, Debug)]
#[command(name = "phylodist", version, about = "Gene tree vs species tree distance table")]
struct Args {
    /// Newick file with the species tree (first tree of the file is used)
    #[arg(short = 's', long = "species")]
    species: PathBuf,

    /// Newick file with one gene tree per line (may be .gz)
    #[arg(short = 'g', long = "genes")]
    genes: PathBuf,

    /// Output path for the TSV table (use a .gz suffix to compress)
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Distances to compute: recon | rf | hdist | all
    #[arg(long = "metric", value_enum, default_value_t = MetricArg::All)]
    metric: MetricArg,

    /// Quiet mode: suppresses progress messages on stdout
    #[arg(short = 'q', long = "quiet", default_value_t = false)]
    quiet: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum MetricArg {
    /// duplications, losses and deep coalescences only
    Recon,
    /// Robinson-Foulds only
    Rf,
    /// Robinson-Foulds plus the Hungarian H-distance
    Hdist,
    /// everything, including the approximate SPR
    All,
}

fn log_if(show: bool, msg: String) {
    if show {
        println!("{msg}");
    }
}

fn main() {
    let args = Args::parse();

    let t0 = Instant::now();
    let species_trees = match read_newick_trees(&args.species) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Failed to read species tree {:?}: {e}", args.species);
            std::process::exit(2);
        }
    };
    let gene_trees = match read_newick_trees(&args.genes) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Failed to read gene trees {:?}: {e}", args.genes);
            std::process::exit(2);
        }
    };
    log_if(
        !args.quiet,
        format!("Read {} gene trees and a species tree in {:.3}s", gene_trees.len(), t0.elapsed().as_secs_f64()),
    );

    let mut sptree = match TreeShape::from_source(&species_trees[0].1)
        .and_then(|shape| Topology::from_shape(&shape, None))
        .and_then(SpeciesTree::new)
    {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Species tree is unusable: {e}");
            std::process::exit(3);
        }
    };

    let columns: Vec<&str> = match args.metric {
        MetricArg::Recon => DISTANCE_NAMES[..3].iter().map(|(s, _)| *s).collect(),
        MetricArg::Rf => vec![DISTANCE_NAMES[3].0],
        MetricArg::Hdist => vec![DISTANCE_NAMES[3].0, DISTANCE_NAMES[4].0],
        MetricArg::All => DISTANCE_NAMES.iter().map(|(s, _)| *s).collect(),
    };
    log_if(!args.quiet, format!("Scoring {} gene trees [{}]", gene_trees.len(), columns.join(",")));

    let t1 = Instant::now();
    let mut names = Vec::with_capacity(gene_trees.len());
    let mut rows: Vec<Vec<i32>> = Vec::with_capacity(gene_trees.len());
    for (name, phylo) in &gene_trees {
        let gtree = TreeShape::from_source(phylo)
            .and_then(|shape| Topology::from_shape(&shape, None))
            .and_then(|topo| GeneTree::new(topo, &sptree));
        let row = gtree.and_then(|mut gtree| score(&mut gtree, &mut sptree, args.metric));
        match row {
            Ok(row) => {
                names.push(name.clone());
                rows.push(row);
            }
            Err(e) => {
                eprintln!("Skipping {name}: {e}");
            }
        }
    }
    if rows.is_empty() {
        eprintln!("No gene tree could be scored against {:?}.", args.species);
        std::process::exit(3);
    }
    log_if(!args.quiet, format!("Scored {} gene trees in {:.3}s", rows.len(), t1.elapsed().as_secs_f64()));

    let t2 = Instant::now();
    if let Err(e) = write_table_tsv(&args.output, &columns, &names, &rows) {
        eprintln!("Failed to write output {:?}: {e}", args.output);
        std::process::exit(4);
    }
    log_if(!args.quiet, format!("Wrote {:?} in {:.3}s", args.output, t2.elapsed().as_secs_f64()));
}

fn score(
    gtree: &mut GeneTree,
    sptree: &mut SpeciesTree,
    metric: MetricArg,
) -> Result<Vec<i32>, phylodist::error::PhyloError> {
    use phylodist::reconcile::DsprLevel;
    Ok(match metric {
        MetricArg::Recon => {
            let (dup, los, dco) = gtree.reconcile(sptree)?;
            vec![dup, los, dco]
        }
        MetricArg::Rf => {
            let rf = gtree.dspr(sptree, DsprLevel::RfOnly)?;
            vec![rf]
        }
        MetricArg::Hdist => {
            gtree.dspr(sptree, DsprLevel::Hdist)?;
            vec![gtree.split.rf, gtree.split.hdist]
        }
        MetricArg::All => gtree.distances(sptree)?.to_vec(),
    })
}
