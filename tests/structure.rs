//! Structuring scenarios over hand-built graphs.

mod common;

use relift::cfg::{structure_blocks, BlockGraph, FlowBlock};

fn count_kind(fb: &FlowBlock, pred: &dyn Fn(&FlowBlock) -> bool) -> usize {
    let mut count = usize::from(pred(fb));
    match fb {
        FlowBlock::Sequence(parts) => {
            for p in parts {
                count += count_kind(p, pred);
            }
        }
        FlowBlock::IfThen { cond, body } => {
            count += count_kind(cond, pred) + count_kind(body, pred);
        }
        FlowBlock::IfElse {
            cond,
            then_body,
            else_body,
        } => {
            count += count_kind(cond, pred)
                + count_kind(then_body, pred)
                + count_kind(else_body, pred);
        }
        FlowBlock::WhileDo { cond, body } => {
            count += count_kind(cond, pred) + count_kind(body, pred);
        }
        FlowBlock::DoWhile { body } | FlowBlock::InfLoop { body } => {
            count += count_kind(body, pred);
        }
        FlowBlock::Switch { cond, cases } => {
            count += count_kind(cond, pred);
            for c in cases {
                count += count_kind(c, pred);
            }
        }
        FlowBlock::Basic(_) => {}
    }
    count
}

/// One back-edge loop plus a cross edge that blocks canonical reduction:
/// the loop is recovered and the cross edge becomes a goto, in bounded
/// iterations.
#[test]
fn irreducible_remnant_becomes_goto() {
    let mut g = BlockGraph::new();
    let b0 = g.new_block(None);
    let b1 = g.new_block(None);
    let b2 = g.new_block(None);
    let b3 = g.new_block(None);
    // Loop b1 ⇄ b2 with b2 exiting to b3, plus the cross entry b0 → b2
    g.add_edge(b0, b1);
    g.add_edge(b0, b2);
    g.add_edge(b1, b2);
    g.add_edge(b2, b1);
    g.add_edge(b2, b3);

    let result = structure_blocks(&mut g, 1000).unwrap();

    assert!(
        !result.gotos.is_empty(),
        "the irreducible edge must be labeled as goto"
    );
    assert!(result.iterations < 1000, "structuring terminates early");

    // Every block is referenced exactly once by the final tree
    let mut blocks = Vec::new();
    result.root.collect_blocks(&mut blocks);
    blocks.sort();
    assert_eq!(blocks, vec![b0, b1, b2, b3]);

    // A loop construct was still recovered around the back edge
    let loops = count_kind(&result.root, &|fb| {
        matches!(
            fb,
            FlowBlock::DoWhile { .. } | FlowBlock::WhileDo { .. } | FlowBlock::InfLoop { .. }
        )
    });
    assert!(loops >= 1, "got {:?}", result.root);
}

/// Nested constructs: a while loop containing an if-then collapses fully
/// with no gotos.
#[test]
fn nested_loop_and_conditional() {
    let mut g = BlockGraph::new();
    let entry = g.new_block(None);
    let header = g.new_block(None);
    let body_cond = g.new_block(None);
    let body_then = g.new_block(None);
    let latch = g.new_block(None);
    let exit = g.new_block(None);

    g.add_edge(entry, header);
    g.add_edge(header, body_cond);
    g.add_edge(header, exit);
    g.add_edge(body_cond, body_then);
    g.add_edge(body_cond, latch);
    g.add_edge(body_then, latch);
    g.add_edge(latch, header);

    let result = structure_blocks(&mut g, 1000).unwrap();
    assert!(result.gotos.is_empty(), "got {:?}", result.root);

    let mut blocks = Vec::new();
    result.root.collect_blocks(&mut blocks);
    assert_eq!(blocks.len(), 6);

    let whiles = count_kind(&result.root, &|fb| matches!(fb, FlowBlock::WhileDo { .. }));
    let ifs = count_kind(&result.root, &|fb| matches!(fb, FlowBlock::IfThen { .. }));
    assert_eq!(whiles, 1);
    assert_eq!(ifs, 1);
}
