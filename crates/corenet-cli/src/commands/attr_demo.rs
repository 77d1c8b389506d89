use corenet_core::{AttributeKey, AttributeMap};

pub fn run() {
    let map: AttributeMap<i64> = AttributeMap::new();
    let requests = AttributeKey::value_of("corenet.cli.requests");
    let bytes = AttributeKey::value_of("corenet.cli.bytes");

    let attr = map.get_attribute(&requests);
    attr.set(1);
    println!("requests = {:?}", attr.get());

    attr.set(attr.get().copied().unwrap_or(0) + 1);
    println!("requests after increment = {:?}", attr.get());

    map.get_attribute(&bytes).set(4096);
    println!("bytes = {:?}", map.get_attribute(&bytes).get());

    println!("has_attribute(requests) = {}", map.has_attribute(&requests));
    let removed = attr.get_and_remove();
    println!("removed requests = {removed:?}");
    println!("has_attribute(requests) after remove = {}", map.has_attribute(&requests));

    let fresh = map.get_attribute(&requests);
    println!("fresh slot value = {:?}", fresh.get());
}
