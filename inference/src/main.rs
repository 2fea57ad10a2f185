use colored::Colorize;
use dfdx::prelude::*;
use rand::{rngs::StdRng, SeedableRng};

use our_model::{utils::pretty_print_num, Decoding, TokenBatch, Transformer, TransformerConfig};

const LAYERS: usize = 6;
const MAX_SEQ_LEN: usize = 100;
const EMBED_DIM: usize = 512;
const HEADS: usize = 8;
const VOCAB: usize = 10;

const START_TOKEN: usize = 1;
const END_TOKEN: usize = 2;
const MAX_NEW_TOKENS: usize = 12;

fn main() {
    if let Err(e) = run() {
        println!("{} {e}", "Error:".bold().red());
        std::process::exit(1);
    }
}

fn run() -> Result<(), our_model::Error> {
    let dev = Cpu::default();
    let cfg = TransformerConfig {
        embed_size: EMBED_DIM,
        heads: HEADS,
        num_layers: LAYERS,
        max_length: MAX_SEQ_LEN,
        ..TransformerConfig::new(VOCAB, VOCAB)
    };
    let model = Transformer::try_new(&cfg, &dev)?;
    println!(
        "Model Parameters: {}",
        pretty_print_num(model.num_params()).bold()
    );

    let src = TokenBatch::new(vec![
        vec![1, 5, 6, 4, 3, 9, 5, 2, 0],
        vec![1, 8, 7, 3, 4, 5, 6, 7, 2],
    ])?;
    let trg = TokenBatch::new(vec![
        vec![1, 7, 4, 3, 5, 9, 2, 0],
        vec![1, 5, 6, 2, 4, 7, 6, 2],
    ])?;
    let logits = model.try_forward((&src, &trg.without_last()?))?;
    println!("Logits shape: {}", format!("{:?}", logits.shape()).green());

    let mut rng = StdRng::seed_from_u64(0);
    for row in src.rows() {
        let greedy = model.generate(
            row,
            START_TOKEN,
            END_TOKEN,
            MAX_NEW_TOKENS,
            Decoding::Greedy,
            &mut rng,
        )?;
        let sampled = model.generate(
            row,
            START_TOKEN,
            END_TOKEN,
            MAX_NEW_TOKENS,
            Decoding::Sample { temperature: 0.8 },
            &mut rng,
        )?;
        println!("{} {:?}", "Source:".bold(), row);
        println!("  greedy  {greedy:?}");
        println!("  sampled {sampled:?}");
    }
    Ok(())
}
