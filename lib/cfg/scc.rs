//! Strongly connected components of the intraprocedural CFG.

use crate::cfg::{Block, BlockId};
use rustc_hash::FxHashMap;

/// One component, blocks in reverse postorder.
#[derive(Clone, Debug)]
pub struct Scc {
    blocks: Vec<BlockId>,
    is_loop: bool,
}

impl Scc {
    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    /// More than one block, or a single block with a self edge.
    pub fn is_loop(&self) -> bool {
        self.is_loop
    }
}

/// Tarjan's algorithm over the blocks reachable from `entry`, components
/// returned in topological order, blocks within a component in reverse
/// postorder.
pub fn decompose(blocks: &[Block], entry: BlockId) -> Vec<Scc> {
    struct Tarjan<'a> {
        blocks: &'a [Block],
        index: FxHashMap<BlockId, usize>,
        lowlink: FxHashMap<BlockId, usize>,
        on_stack: FxHashMap<BlockId, bool>,
        stack: Vec<BlockId>,
        next_index: usize,
        sccs: Vec<Vec<BlockId>>,
    }

    impl<'a> Tarjan<'a> {
        fn visit(&mut self, v: BlockId) {
            // Explicit call stack; block graphs of large binaries are deep.
            enum Step {
                Enter(BlockId),
                Leave(BlockId, BlockId),
            }
            let mut work = vec![Step::Enter(v)];
            while let Some(step) = work.pop() {
                match step {
                    Step::Enter(v) => {
                        if self.index.contains_key(&v) {
                            continue;
                        }
                        self.index.insert(v, self.next_index);
                        self.lowlink.insert(v, self.next_index);
                        self.next_index += 1;
                        self.stack.push(v);
                        self.on_stack.insert(v, true);
                        let succ: Vec<BlockId> =
                            self.blocks[v].succ().iter().map(|(b, _)| *b).collect();
                        for w in succ {
                            match self.index.get(&w) {
                                None => {
                                    work.push(Step::Leave(v, w));
                                    work.push(Step::Enter(w));
                                }
                                Some(widx) => {
                                    if *self.on_stack.get(&w).unwrap_or(&false) {
                                        let low = (*self.lowlink.get(&v).unwrap()).min(*widx);
                                        self.lowlink.insert(v, low);
                                    }
                                }
                            }
                        }
                        work.push(Step::Leave(v, v));
                    }
                    Step::Leave(v, w) => {
                        if v != w {
                            if *self.on_stack.get(&w).unwrap_or(&false) {
                                let low = (*self.lowlink.get(&v).unwrap())
                                    .min(*self.lowlink.get(&w).unwrap());
                                self.lowlink.insert(v, low);
                            }
                            continue;
                        }
                        if self.lowlink[&v] == self.index[&v] {
                            let mut component = Vec::new();
                            while let Some(w) = self.stack.pop() {
                                self.on_stack.insert(w, false);
                                component.push(w);
                                if w == v {
                                    break;
                                }
                            }
                            self.sccs.push(component);
                        }
                    }
                }
            }
        }
    }

    let mut tarjan = Tarjan {
        blocks,
        index: FxHashMap::default(),
        lowlink: FxHashMap::default(),
        on_stack: FxHashMap::default(),
        stack: Vec::new(),
        next_index: 0,
        sccs: Vec::new(),
    };
    tarjan.visit(entry);

    // Tarjan emits components in reverse topological order; the discovery
    // index doubles as a preorder for intra-component ordering.
    let index = tarjan.index;
    let mut sccs: Vec<Scc> = tarjan
        .sccs
        .into_iter()
        .map(|mut component| {
            component.sort_by_key(|b| index[b]);
            let is_loop = component.len() > 1
                || blocks[component[0]]
                    .succ()
                    .iter()
                    .any(|(b, _)| *b == component[0]);
            Scc {
                blocks: component,
                is_loop,
            }
        })
        .collect();
    sccs.reverse();
    sccs
}
