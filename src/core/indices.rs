use hashbrown::HashMap;

/// Entity id to position in the ordered collection.
pub type PosIndex = HashMap<String, usize>;
