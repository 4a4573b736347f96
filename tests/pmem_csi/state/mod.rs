mod durability;
