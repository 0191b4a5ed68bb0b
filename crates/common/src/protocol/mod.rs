// Wire protocol definitions shared by the hub and client.

pub mod ws;
