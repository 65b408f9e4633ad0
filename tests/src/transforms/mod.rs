mod flatten;
mod indirect_branch;
mod indirect_call;
mod mba;
mod opaque_predicate;
mod virtualize;
