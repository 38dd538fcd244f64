//! Bottom-up evaluation of a rule set to its least fixpoint

use std::collections::BTreeMap;

use dse_node::{Row, Table, Tables, Value};

use crate::rule::{Atom, Rule, Term};

type Bindings = BTreeMap<String, Value>;

/// Match `args` against `row`, extending `bindings`.
///
/// Returns false on an arity mismatch, a constant mismatch, or a variable
/// already bound to a different value.
pub(crate) fn unify(args: &[Term], row: &[Value], bindings: &mut Bindings) -> bool {
    if args.len() != row.len() {
        return false;
    }

    for (term, value) in args.iter().zip(row) {
        match term {
            Term::Const(constant) => {
                if constant != value {
                    return false;
                }
            }
            Term::Var(name) if name == crate::rule::WILDCARD => {}
            Term::Var(name) => match bindings.get(name) {
                Some(bound) if bound != value => return false,
                Some(_) => {}
                None => {
                    bindings.insert(name.clone(), value.clone());
                }
            },
        }
    }
    true
}

fn instantiate(head: &Atom, bindings: &Bindings) -> Option<Row> {
    head.args
        .iter()
        .map(|term| match term {
            Term::Const(value) => Some(value.clone()),
            Term::Var(name) => bindings.get(name).cloned(),
        })
        .collect()
}

struct Evaluation {
    /// module -> table -> extent, fixed for the whole evaluation
    externals: BTreeMap<String, Tables>,
    derived: Tables,
}

impl Evaluation {
    fn relation(&self, atom: &Atom) -> Option<&Table> {
        match &atom.module {
            Some(module) => self
                .externals
                .get(module)
                .and_then(|tables| tables.get(&atom.table)),
            None => self.derived.get(&atom.table),
        }
    }

    fn solve(&self, body: &[Atom], bindings: &Bindings, solutions: &mut Vec<Bindings>) {
        let Some((atom, rest)) = body.split_first() else {
            solutions.push(bindings.clone());
            return;
        };
        let Some(relation) = self.relation(atom) else {
            return;
        };

        for row in relation {
            let mut extended = bindings.clone();
            if unify(&atom.args, row, &mut extended) {
                self.solve(rest, &extended, solutions);
            }
        }
    }
}

/// Derive every fact `rules` imply.
///
/// `external(module, table)` supplies the extent of each qualified body
/// atom; it is called once per distinct `module:table`.
pub(crate) fn evaluate<F>(rules: &[Rule], mut external: F) -> Tables
where
    F: FnMut(&str, &str) -> Table,
{
    let mut evaluation = Evaluation {
        externals: BTreeMap::new(),
        derived: Tables::new(),
    };

    for (module, table) in rules.iter().flat_map(Rule::references) {
        let tables = evaluation.externals.entry(module.to_string()).or_default();
        if !tables.contains_key(table) {
            tables.insert(table.to_string(), external(module, table));
        }
    }

    loop {
        let mut derived = Vec::new();
        for rule in rules {
            let mut solutions = Vec::new();
            evaluation.solve(&rule.body, &Bindings::new(), &mut solutions);
            derived.extend(
                solutions
                    .iter()
                    .filter_map(|bindings| instantiate(&rule.head, bindings))
                    .map(|row| (rule.head.table.clone(), row)),
            );
        }

        let mut changed = false;
        for (table, row) in derived {
            changed |= evaluation.derived.entry(table).or_default().insert(row);
        }
        if !changed {
            return evaluation.derived;
        }
    }
}
